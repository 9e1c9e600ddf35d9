// Last.fm authentication helpers
// Web token flow over the raw API, plus the username/password flow of rustfm-scrobble-proxy

use anyhow::{Context, Result};
use rustfm_scrobble_proxy::Scrobbler;
use serde::Deserialize;
use std::io::{self, Write};

const API_ROOT: &str = "https://ws.audioscrobbler.com/2.0/";
const AUTH_PAGE: &str = "https://www.last.fm/api/auth/";

/// Error code returned while the token is still waiting for user approval
const TOKEN_NOT_AUTHORIZED: i64 = 14;
const SESSION_ATTEMPTS: usize = 5;

/// Session granted by Last.fm
#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session: Session,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: i64,
    message: String,
}

/// md5 api_sig over the alphabetically sorted parameters followed by the secret
pub fn sign(params: &[(&str, &str)], api_secret: &str) -> String {
    let mut sorted = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut payload: String = sorted.iter().map(|(k, v)| format!("{}{}", k, v)).collect();
    payload.push_str(api_secret);

    format!("{:x}", md5::compute(payload.as_bytes()))
}

/// URL the user opens to approve `token`
pub fn authorize_url(api_key: &str, token: &str) -> String {
    format!("{}?api_key={}&token={}", AUTH_PAGE, api_key, token)
}

/// Signed GET call; returns the raw JSON body or the API error
fn call(params: &[(&str, &str)], api_secret: &str) -> Result<std::result::Result<String, ApiError>> {
    let api_sig = sign(params, api_secret);

    let mut request = attohttpc::get(API_ROOT);
    for (key, value) in params {
        request = request.param(key, value);
    }
    let response = request
        .param("api_sig", &api_sig)
        .param("format", "json")
        .send()
        .context("Failed to reach Last.fm")?;

    let body = response.text().context("Failed to read Last.fm response")?;
    Ok(parse_api_error(&body).map_or(Ok(body), Err))
}

fn parse_api_error(body: &str) -> Option<ApiError> {
    serde_json::from_str::<ApiError>(body).ok()
}

/// Ask Last.fm for an unauthorized request token
pub fn request_token(api_key: &str, api_secret: &str) -> Result<String> {
    let body = call(&[("api_key", api_key), ("method", "auth.getToken")], api_secret)?
        .map_err(|e| anyhow::anyhow!("Last.fm error {}: {}", e.error, e.message))?;

    let parsed: TokenResponse =
        serde_json::from_str(&body).context("Unexpected auth.getToken response")?;
    Ok(parsed.token)
}

/// Exchange an approved token for a session; `Ok(None)` while not yet approved
pub fn request_session(api_key: &str, api_secret: &str, token: &str) -> Result<Option<Session>> {
    let params = [
        ("api_key", api_key),
        ("method", "auth.getSession"),
        ("token", token),
    ];

    match call(&params, api_secret)? {
        Ok(body) => {
            let parsed: SessionResponse =
                serde_json::from_str(&body).context("Unexpected auth.getSession response")?;
            Ok(Some(parsed.session))
        }
        Err(e) if e.error == TOKEN_NOT_AUTHORIZED => Ok(None),
        Err(e) => anyhow::bail!("Last.fm error {}: {}", e.error, e.message),
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Interactive web flow: the user approves the app in a browser.
/// Returns the session key on success
pub fn authenticate_with_token(api_key: &str, api_secret: &str) -> Result<String> {
    println!("Starting Last.fm authentication...\n");

    let token = request_token(api_key, api_secret)?;
    println!("Open this URL and allow access:\n\n  {}\n", authorize_url(api_key, &token));

    for _ in 0..SESSION_ATTEMPTS {
        prompt("Press Enter once access is granted...")?;

        match request_session(api_key, api_secret, &token)? {
            Some(session) => {
                println!("Session key obtained for {}!\n", session.name);
                return Ok(session.key);
            }
            None => println!("Last.fm has not seen the approval yet."),
        }
    }

    anyhow::bail!("Token was not authorized after {} attempts", SESSION_ATTEMPTS)
}

/// Perform the Last.fm authentication flow using username/password.
/// Returns the session key on success
pub fn authenticate_with_password(api_key: &str, api_secret: &str) -> Result<String> {
    println!("Starting Last.fm authentication...\n");

    let mut scrobbler = Scrobbler::new(api_key, api_secret);

    let username = prompt("Last.fm Username: ")?;
    let password = prompt("Last.fm Password: ")?;

    println!("\nAuthenticating with Last.fm...");
    let session = scrobbler.authenticate_with_password(&username, &password)?;
    println!("Session key obtained successfully!\n");

    Ok(session.key)
}
