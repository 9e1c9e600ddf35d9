// Engine runner
// Wires a player source, the scrobble engine and a submitter together:
//
//   source thread ──snapshots──▶ decision thread ──submissions──▶ submit worker
//
// Both channels are bounded and FIFO, so notifications are handled in the
// order the player sent them and submissions for a track keep their order.

use super::{ScrobbleEngine, ScrobbleThreshold, Submission};
use crate::error::Result;
use crate::player::{PlaybackSnapshot, PlayerSource};
use crate::scrobbler::Submitter;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const SNAPSHOT_QUEUE_SIZE: usize = 16;
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Tuning for a running engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub threshold: ScrobbleThreshold,
    /// How long one idle wait may block before the stop flag is checked
    pub poll_interval: Duration,
    /// Bound of the submission queue
    pub queue_size: usize,
    /// Delay policy between reconnect attempts
    pub reconnect: ExponentialBackoff,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            threshold: ScrobbleThreshold::default(),
            poll_interval: Duration::from_secs(1),
            queue_size: 32,
            reconnect: ExponentialBackoff {
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            },
        }
    }
}

/// What the engine has done so far
#[derive(Debug, Clone, Default)]
pub struct Activity {
    pub connected: bool,
    pub now_playing: Option<String>,
    pub last_scrobbled: Option<String>,
    pub announcements: u64,
    pub scrobbles: u64,
    pub failures: u64,
    pub reconnects: u64,
}

type SharedActivity = Arc<RwLock<Activity>>;

fn record(activity: &SharedActivity, update: impl FnOnce(&mut Activity)) {
    let mut guard = activity.write().unwrap_or_else(|e| e.into_inner());
    update(&mut guard);
}

/// Shared flag asking every engine thread to wind down
#[derive(Debug, Clone, Default)]
struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

enum SourceEvent {
    /// State after a change notification
    Changed(PlaybackSnapshot),
    /// State after (re)connecting; prior session state is stale
    Resync(PlaybackSnapshot),
}

/// Handle to a running engine
pub struct EngineHandle {
    stop: StopSignal,
    activity: SharedActivity,
    threads: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Start following `source` and submitting through `submitter`
    pub fn start<S, U>(source: S, submitter: U, options: EngineOptions) -> Result<Self>
    where
        S: PlayerSource + 'static,
        U: Submitter + 'static,
    {
        let stop = StopSignal::default();
        let activity = SharedActivity::default();

        let (snapshot_tx, snapshot_rx) = mpsc::sync_channel(SNAPSHOT_QUEUE_SIZE);
        let (submit_tx, submit_rx) = mpsc::sync_channel(options.queue_size.max(1));

        let worker = {
            let activity = activity.clone();
            thread::Builder::new()
                .name("submit-worker".to_string())
                .spawn(move || run_submitter(submitter, submit_rx, activity))?
        };

        let decisions = {
            let engine = ScrobbleEngine::new(options.threshold);
            thread::Builder::new()
                .name("scrobble-engine".to_string())
                .spawn(move || run_decisions(engine, snapshot_rx, submit_tx))?
        };

        let follower = {
            let stop = stop.clone();
            let activity = activity.clone();
            thread::Builder::new()
                .name("player-source".to_string())
                .spawn(move || {
                    SourceLoop {
                        source,
                        events: snapshot_tx,
                        stop,
                        activity,
                        poll_interval: options.poll_interval,
                        reconnect: options.reconnect,
                    }
                    .run()
                })?
        };

        log::info!("Scrobble engine started");

        Ok(Self {
            stop,
            activity,
            threads: vec![follower, decisions, worker],
        })
    }

    /// Latest activity report
    pub fn activity(&self) -> Activity {
        self.activity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Ask the engine to stop without waiting for it
    pub fn request_stop(&self) {
        self.stop.request();
    }

    /// True once the engine ended on its own, e.g. reconnecting gave up
    pub fn is_finished(&self) -> bool {
        self.threads.iter().all(|t| t.is_finished())
    }

    /// Block until the engine ends on its own. Queued submissions are flushed first
    pub fn wait(mut self) -> Activity {
        self.join_all();
        self.activity()
    }

    /// Stop the engine, release the subscription and flush queued submissions
    pub fn stop(mut self) -> Activity {
        self.request_stop();
        self.join_all();
        log::info!("Scrobble engine stopped");
        self.activity()
    }

    fn join_all(&mut self) {
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("engine").to_string();
            if handle.join().is_err() {
                log::error!("Thread {} panicked", name);
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.request_stop();
            self.join_all();
        }
    }
}

/// Owns the subscription and turns notifications into snapshots
struct SourceLoop<S> {
    source: S,
    events: SyncSender<SourceEvent>,
    stop: StopSignal,
    activity: SharedActivity,
    poll_interval: Duration,
    reconnect: ExponentialBackoff,
}

impl<S: PlayerSource> SourceLoop<S> {
    fn run(mut self) {
        let mut synced = false;

        while !self.stopped() {
            if !synced {
                let Some(snapshot) = self.resynchronize() else {
                    break;
                };
                if self.events.send(SourceEvent::Resync(snapshot)).is_err() {
                    break;
                }
                synced = true;
                continue;
            }

            let changed = self
                .source
                .wait_for_change(self.poll_interval)
                .and_then(|changed| match changed {
                    true => self.source.current_status().map(Some),
                    false => Ok(None),
                });

            match changed {
                Ok(Some(snapshot)) => {
                    if self.events.send(SourceEvent::Changed(snapshot)).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Lost player subscription: {}", e);
                    record(&self.activity, |a| a.connected = false);
                    synced = false;
                }
            }
        }

        self.source.close();
        record(&self.activity, |a| a.connected = false);
        log::debug!("Player source loop finished");
    }

    fn stopped(&self) -> bool {
        self.stop.is_requested()
    }

    /// Connect if needed and fetch a fresh snapshot, backing off between attempts.
    /// Returns `None` when stopped or when the backoff policy gives up.
    fn resynchronize(&mut self) -> Option<PlaybackSnapshot> {
        self.reconnect.reset();

        loop {
            if self.stopped() {
                return None;
            }

            let attempt = self.source.current_status().or_else(|_| {
                self.source.reconnect()?;
                record(&self.activity, |a| a.reconnects += 1);
                self.source.current_status()
            });

            match attempt {
                Ok(snapshot) => {
                    record(&self.activity, |a| a.connected = true);
                    return Some(snapshot);
                }
                Err(e) => match self.reconnect.next_backoff() {
                    Some(delay) => {
                        log::warn!("Player unavailable ({}), retrying in {:?}", e, delay);
                        self.sleep(delay);
                    }
                    None => {
                        log::error!("Giving up on the player: {}", e);
                        return None;
                    }
                },
            }
        }
    }

    fn sleep(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(STOP_CHECK_INTERVAL));
        }
    }
}

fn run_decisions<C: crate::stopwatch::Clock>(
    mut engine: ScrobbleEngine<C>,
    events: Receiver<SourceEvent>,
    submissions: SyncSender<Submission>,
) {
    for event in events {
        let pending = match event {
            SourceEvent::Changed(snapshot) => engine.observe(&snapshot),
            SourceEvent::Resync(snapshot) => engine.resync(&snapshot),
        };

        for submission in pending {
            if submissions.send(submission).is_err() {
                log::error!("Submit worker is gone, stopping decisions");
                return;
            }
        }
    }
}

fn run_submitter<U: Submitter>(submitter: U, queue: Receiver<Submission>, activity: SharedActivity) {
    for submission in queue {
        match submission {
            Submission::NowPlaying(track) => match submitter.announce(&track) {
                Ok(()) => record(&activity, |a| {
                    a.now_playing = Some(track.to_string());
                    a.announcements += 1;
                }),
                Err(e) => {
                    log::warn!("Dropped now playing for {}: {}", track, e);
                    record(&activity, |a| a.failures += 1);
                }
            },
            Submission::Scrobble { track, at } => match submitter.scrobble(&track, at) {
                Ok(()) => record(&activity, |a| {
                    a.last_scrobbled = Some(track.to_string());
                    a.scrobbles += 1;
                }),
                Err(e) => {
                    log::warn!("Dropped scrobble for {}: {}", track, e);
                    record(&activity, |a| a.failures += 1);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, SubmitError};
    use crate::player::{MpdClient, TrackRef, TransportState};
    use chrono::{DateTime, Utc};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::{RecvTimeoutError, Sender};
    use std::net::TcpListener;
    use std::sync::Mutex;

    enum Step {
        Status(PlaybackSnapshot),
        /// Drop the connection; the player shows this state once reconnected
        Drop(PlaybackSnapshot),
    }

    struct FakeSource {
        steps: Receiver<Step>,
        current: PlaybackSnapshot,
        connected: bool,
        reconnects: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    impl PlayerSource for FakeSource {
        fn current_status(&mut self) -> Result<PlaybackSnapshot> {
            if !self.connected {
                return Err(Error::SourceDisconnected("not connected".to_string()));
            }
            Ok(self.current.clone())
        }

        fn wait_for_change(&mut self, timeout: Duration) -> Result<bool> {
            if !self.connected {
                return Err(Error::SourceDisconnected("not connected".to_string()));
            }
            match self.steps.recv_timeout(timeout) {
                Ok(Step::Status(snapshot)) => {
                    self.current = snapshot;
                    Ok(true)
                }
                Ok(Step::Drop(snapshot)) => {
                    self.current = snapshot;
                    self.connected = false;
                    Err(Error::SourceDisconnected("connection reset".to_string()))
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(false),
            }
        }

        fn reconnect(&mut self) -> Result<()> {
            self.connected = true;
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSubmitter {
        calls: Arc<Mutex<Vec<String>>>,
        reject: Option<String>,
    }

    impl RecordingSubmitter {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String, file_id: &str) -> std::result::Result<(), SubmitError> {
            self.calls.lock().unwrap().push(call);
            if self.reject.as_deref() == Some(file_id) {
                return Err(SubmitError::Service {
                    service: "fake".to_string(),
                    message: "rejected".to_string(),
                });
            }
            Ok(())
        }
    }

    impl Submitter for RecordingSubmitter {
        fn announce(&self, track: &TrackRef) -> std::result::Result<(), SubmitError> {
            self.push(format!("announce:{}", track.file_id), &track.file_id)
        }

        fn scrobble(&self, track: &TrackRef, _at: DateTime<Utc>) -> std::result::Result<(), SubmitError> {
            self.push(format!("scrobble:{}", track.file_id), &track.file_id)
        }
    }

    struct Harness {
        steps: Sender<Step>,
        reconnects: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
        submitter: RecordingSubmitter,
        handle: EngineHandle,
    }

    fn playing(file_id: &str, duration: f64, elapsed: f64) -> PlaybackSnapshot {
        PlaybackSnapshot {
            transport_state: TransportState::Playing,
            track: Some(TrackRef {
                file_id: file_id.to_string(),
                artist: "Artist".to_string(),
                title: file_id.to_string(),
                album: None,
            }),
            elapsed_seconds: elapsed,
            duration_seconds: Some(duration),
        }
    }

    fn fast_options(threshold: ScrobbleThreshold) -> EngineOptions {
        EngineOptions {
            threshold,
            poll_interval: Duration::from_millis(10),
            queue_size: 4,
            reconnect: ExponentialBackoff {
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(5),
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            },
        }
    }

    fn start(initial: PlaybackSnapshot, threshold: ScrobbleThreshold, submitter: RecordingSubmitter) -> Harness {
        let (steps, rx) = mpsc::channel();
        let reconnects = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));

        let source = FakeSource {
            steps: rx,
            current: initial,
            connected: false,
            reconnects: reconnects.clone(),
            closed: closed.clone(),
        };

        let handle = EngineHandle::start(source, submitter.clone(), fast_options(threshold)).unwrap();
        Harness {
            steps,
            reconnects,
            closed,
            submitter,
            handle,
        }
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn wait_for_calls(submitter: &RecordingSubmitter, count: usize) -> Vec<String> {
        wait_until(|| submitter.calls().len() >= count);
        submitter.calls()
    }

    #[test]
    fn notifications_flow_through_to_the_submitter_in_order() {
        let eager = ScrobbleThreshold {
            min_fraction: 0.0,
            max_absolute_seconds: 360.0,
        };
        let h = start(playing("a", 100.0, 0.0), eager, RecordingSubmitter::default());

        h.steps.send(Step::Status(playing("a", 100.0, 1.0))).unwrap();
        h.steps.send(Step::Status(playing("a", 100.0, 2.0))).unwrap();
        thread::sleep(Duration::from_millis(20));
        h.steps.send(Step::Status(playing("b", 100.0, 0.0))).unwrap();

        let calls = wait_for_calls(&h.submitter, 3);
        assert_eq!(calls, vec!["announce:a", "scrobble:a", "announce:b"]);

        wait_until(|| h.handle.activity().announcements == 2);
        let activity = h.handle.activity();
        assert!(activity.connected);
        assert_eq!(activity.announcements, 2);
        assert_eq!(activity.scrobbles, 1);
        assert_eq!(activity.last_scrobbled.as_deref(), Some("Artist - a"));

        h.handle.stop();
        assert!(h.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn reconnect_resynchronizes_without_retroactive_scrobble() {
        let h = start(
            playing("a", 200.0, 0.0),
            ScrobbleThreshold::default(),
            RecordingSubmitter::default(),
        );
        wait_for_calls(&h.submitter, 1);

        h.steps.send(Step::Drop(playing("b", 200.0, 160.0))).unwrap();

        let calls = wait_for_calls(&h.submitter, 2);
        assert_eq!(calls, vec!["announce:a", "announce:b"]);
        assert!(h.reconnects.load(Ordering::SeqCst) >= 2);
        assert!(h.handle.activity().reconnects >= 2);

        h.handle.stop();
        assert_eq!(h.submitter.calls(), vec!["announce:a", "announce:b"]);
    }

    #[test]
    fn failed_submission_does_not_stop_the_engine() {
        let submitter = RecordingSubmitter {
            reject: Some("a".to_string()),
            ..RecordingSubmitter::default()
        };
        let h = start(playing("a", 100.0, 0.0), ScrobbleThreshold::default(), submitter);

        h.steps.send(Step::Status(playing("b", 100.0, 0.0))).unwrap();

        let calls = wait_for_calls(&h.submitter, 2);
        assert_eq!(calls, vec!["announce:a", "announce:b"]);

        wait_until(|| h.handle.activity().announcements == 1);
        let activity = h.handle.activity();
        assert_eq!(activity.failures, 1);
        assert_eq!(activity.announcements, 1);
        assert_eq!(activity.now_playing.as_deref(), Some("Artist - b"));

        h.handle.stop();
    }

    #[test]
    fn stop_releases_the_subscription() {
        let h = start(
            playing("a", 100.0, 0.0),
            ScrobbleThreshold::default(),
            RecordingSubmitter::default(),
        );
        wait_for_calls(&h.submitter, 1);

        h.handle.stop();
        assert!(h.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_reports_final_activity() {
        let h = start(
            playing("a", 100.0, 0.0),
            ScrobbleThreshold::default(),
            RecordingSubmitter::default(),
        );
        wait_for_calls(&h.submitter, 1);
        wait_until(|| h.handle.activity().announcements == 1);
        assert!(!h.handle.is_finished());

        let activity = h.handle.stop();
        assert!(h.closed.load(Ordering::SeqCst));
        assert!(!activity.connected);
        assert_eq!(activity.announcements, 1);
    }

    #[test]
    fn engine_finishes_when_reconnecting_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut options = fast_options(ScrobbleThreshold::default());
        options.reconnect.max_elapsed_time = Some(Duration::from_millis(50));
        let handle = EngineHandle::start(
            MpdClient::new("127.0.0.1", port, None),
            RecordingSubmitter::default(),
            options,
        )
        .unwrap();

        wait_until(|| handle.is_finished());
        assert!(handle.is_finished());

        let activity = handle.wait();
        assert!(!activity.connected);
        assert_eq!(activity.reconnects, 0);
    }

    #[test]
    fn stop_returns_while_the_player_never_answers() {
        // Connections complete in the backlog but nothing ever greets
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let source =
            MpdClient::new("127.0.0.1", port, None).with_reply_timeout(Duration::from_millis(100));
        let handle = EngineHandle::start(
            source,
            RecordingSubmitter::default(),
            fast_options(ScrobbleThreshold::default()),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(150));

        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            handle.stop();
            let _ = done_tx.send(());
        });

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        drop(listener);
    }
}
