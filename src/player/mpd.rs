// MPD client
// Speaks just enough of the MPD text protocol to follow playback:
// status, currentsong and idle notifications on the player subsystem.

use super::{PlaybackSnapshot, PlayerSource, TrackRef, TransportState};
use crate::error::{Error, Result};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Bound on connecting, the greeting and every command reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(3);

type Pairs = Vec<(String, String)>;

/// One open protocol session
struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    /// Bytes of a line cut short by a read timeout
    pending: String,
    idling: bool,
    reply_timeout: Duration,
}

impl Connection {
    fn open(host: &str, port: u16, reply_timeout: Duration) -> Result<Self> {
        let stream = connect_any(host, port, reply_timeout)
            .map_err(|e| Error::SourceDisconnected(format!("{}:{}: {}", host, port, e)))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(reply_timeout))?;
        stream.set_write_timeout(Some(reply_timeout))?;
        let writer = stream.try_clone()?;

        let mut conn = Self {
            reader: BufReader::new(stream),
            writer,
            pending: String::new(),
            idling: false,
            reply_timeout,
        };

        let greeting = conn.next_line().map_err(|e| into_disconnect(e, reply_timeout))?;
        match greeting.strip_prefix("OK MPD ") {
            Some(version) => log::debug!("Connected to MPD {} at {}:{}", version, host, port),
            None => return Err(Error::Protocol(format!("unexpected greeting: {}", greeting))),
        }

        Ok(conn)
    }

    fn send(&mut self, command: &str) -> Result<()> {
        self.writer.write_all(command.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn command(&mut self, command: &str) -> Result<Pairs> {
        self.send(command)?;
        self.read_response()
    }

    fn next_line(&mut self) -> Result<String> {
        loop {
            match self.reader.read_line(&mut self.pending) {
                Ok(0) => {
                    return Err(Error::SourceDisconnected(
                        "connection closed by server".to_string(),
                    ))
                }
                Ok(_) if self.pending.ends_with('\n') => {
                    let line = std::mem::take(&mut self.pending);
                    return Ok(line.trim_end_matches(&['\r', '\n'][..]).to_string());
                }
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_response(&mut self) -> Result<Pairs> {
        let mut pairs = Vec::new();
        loop {
            let line = self.next_line()?;
            if line == "OK" {
                return Ok(pairs);
            }
            pairs.push(parse_line(&line)?);
        }
    }

    fn set_read_timeout(&self, timeout: Duration) -> Result<()> {
        self.reader.get_ref().set_read_timeout(Some(timeout))?;
        Ok(())
    }
}

/// Try every resolved address in turn, each bounded by `timeout`
fn connect_any(host: &str, port: u16, timeout: Duration) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(ErrorKind::NotFound, "host resolved to no addresses")
    }))
}

/// A broken or silent link; the connection is unusable afterwards
fn into_disconnect(err: Error, reply_timeout: Duration) -> Error {
    if is_timeout(&err) {
        return Error::SourceDisconnected(format!("no reply within {:?}", reply_timeout));
    }
    match err {
        Error::Io(io) => Error::SourceDisconnected(io.to_string()),
        other => other,
    }
}

fn parse_line(line: &str) -> Result<(String, String)> {
    if let Some(ack) = line.strip_prefix("ACK ") {
        return Err(Error::Protocol(ack.to_string()));
    }
    line.split_once(": ")
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| Error::Protocol(format!("unexpected line: {}", line)))
}

fn is_timeout(err: &Error) -> bool {
    matches!(err, Error::Io(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut))
}

/// Quote a command argument
fn quote(arg: &str) -> String {
    let escaped = arg.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Client for a single MPD server
pub struct MpdClient {
    host: String,
    port: u16,
    password: Option<String>,
    reply_timeout: Duration,
    conn: Option<Connection>,
}

impl MpdClient {
    /// Create a client without connecting yet
    pub fn new(host: impl Into<String>, port: u16, password: Option<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            conn: None,
        }
    }

    /// Bound connecting and every reply by `timeout` instead of the default
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Create a client and connect right away
    #[cfg(test)]
    pub fn connect(host: impl Into<String>, port: u16, password: Option<String>) -> Result<Self> {
        let mut client = Self::new(host, port, password);
        client.reconnect()?;
        Ok(client)
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Run `f` on the open connection, dropping it if the link broke
    fn with_conn<T>(&mut self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::SourceDisconnected("not connected".to_string()))?;

        // Idle timeouts are handled inside `f`; any timeout left is a silent server
        match f(conn) {
            Ok(value) => Ok(value),
            Err(e) if e.is_disconnect() => {
                self.conn = None;
                Err(into_disconnect(e, self.reply_timeout))
            }
            Err(e) => Err(e),
        }
    }
}

impl PlayerSource for MpdClient {
    fn current_status(&mut self) -> Result<PlaybackSnapshot> {
        let (status, song) = self.with_conn(|conn| {
            let status = conn.command("status")?;
            let song = conn.command("currentsong")?;
            Ok((status, song))
        })?;
        parse_snapshot(&status, &song)
    }

    fn wait_for_change(&mut self, timeout: Duration) -> Result<bool> {
        let outcome = self.with_conn(|conn| {
            if !conn.idling {
                conn.send("idle player")?;
                conn.idling = true;
            }

            conn.set_read_timeout(timeout)?;
            let first = conn.next_line();
            conn.set_read_timeout(conn.reply_timeout)?;

            match first {
                Ok(line) => {
                    conn.idling = false;
                    if line == "OK" {
                        return Ok(false);
                    }
                    let (key, _) = parse_line(&line)?;
                    conn.read_response()?;
                    Ok(key == "changed")
                }
                Err(e) if is_timeout(&e) => {
                    // Leave idle so the connection is usable for commands again
                    conn.send("noidle")?;
                    conn.idling = false;
                    let pairs = conn.read_response()?;
                    Ok(pairs.iter().any(|(k, _)| k == "changed"))
                }
                Err(e) => Err(e),
            }
        });

        if outcome.is_err() {
            if let Some(conn) = self.conn.as_mut() {
                conn.idling = false;
            }
        }
        outcome
    }

    fn reconnect(&mut self) -> Result<()> {
        self.close();

        let mut conn = Connection::open(&self.host, self.port, self.reply_timeout)?;
        if let Some(password) = &self.password {
            conn.command(&format!("password {}", quote(password)))
                .map_err(|e| into_disconnect(e, self.reply_timeout))?;
        }

        log::info!("Connected to MPD at {}:{}", self.host, self.port);
        self.conn = Some(conn);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if conn.idling {
                let _ = conn.send("noidle");
            }
            let _ = conn.send("close");
            log::debug!("Closed MPD connection to {}:{}", self.host, self.port);
        }
    }
}

impl Drop for MpdClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

fn parse_seconds(value: &str) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| Error::Protocol(format!("invalid number of seconds: {}", value)))
}

/// Build a snapshot from `status` and `currentsong` replies
fn parse_snapshot(status: &[(String, String)], song: &[(String, String)]) -> Result<PlaybackSnapshot> {
    let transport_state = match lookup(status, "state") {
        Some("play") => TransportState::Playing,
        Some("pause") => TransportState::Paused,
        Some("stop") => TransportState::Stopped,
        other => {
            return Err(Error::Protocol(format!("unknown player state: {:?}", other)));
        }
    };

    // Older servers only report "time: elapsed:total" with whole seconds
    let legacy_time = lookup(status, "time").and_then(|t| t.split_once(':'));

    let elapsed_seconds = match (lookup(status, "elapsed"), legacy_time) {
        (Some(elapsed), _) => parse_seconds(elapsed)?,
        (None, Some((elapsed, _))) => parse_seconds(elapsed)?,
        (None, None) => 0.0,
    };

    let duration_seconds = match lookup(status, "duration") {
        Some(duration) => Some(parse_seconds(duration)?),
        None => match legacy_time {
            Some((_, total)) => Some(parse_seconds(total)?),
            None => lookup(song, "duration")
                .or_else(|| lookup(song, "Time"))
                .map(parse_seconds)
                .transpose()?,
        },
    };

    Ok(PlaybackSnapshot {
        transport_state,
        track: parse_track(song),
        elapsed_seconds,
        duration_seconds,
    })
}

fn parse_track(song: &[(String, String)]) -> Option<TrackRef> {
    let file_id = lookup(song, "file")?.to_string();

    // Radio streams usually carry only a station name
    let artist = lookup(song, "Artist")
        .or_else(|| lookup(song, "AlbumArtist"))
        .or_else(|| lookup(song, "Name"))
        .unwrap_or_default()
        .to_string();

    let title = match lookup(song, "Title") {
        Some(title) => title.to_string(),
        None => file_id
            .rsplit('/')
            .next()
            .unwrap_or(file_id.as_str())
            .to_string(),
    };

    Some(TrackRef {
        artist,
        title,
        album: lookup(song, "Album").map(str::to_string),
        file_id,
    })
}
