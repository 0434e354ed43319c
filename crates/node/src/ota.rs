//! Remote update listener: status page, reset and firmware upload.
//!
//! Runs on the same current-thread runtime as the cycle controller.  It
//! never restarts the node itself; it sends a [`RestartRequest`] that the
//! main loop picks up on its next iteration.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::state::{SharedState, StatusResponse};

/// Lets the reset/success page reach the browser before the node goes down.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Multipart field carrying the new binary.
const FIRMWARE_FIELD: &str = "firmware";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartRequest {
    Reset,
    FirmwareUpdated,
}

impl fmt::Display for RestartRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reset => write!(f, "reset requested over http"),
            Self::FirmwareUpdated => write!(f, "firmware updated"),
        }
    }
}

#[derive(Clone)]
pub struct OtaState {
    shared: SharedState,
    restart_tx: UnboundedSender<RestartRequest>,
    firmware_path: PathBuf,
    restart_delay: Duration,
}

impl OtaState {
    pub fn new(
        shared: SharedState,
        restart_tx: UnboundedSender<RestartRequest>,
        firmware_path: PathBuf,
    ) -> Self {
        Self {
            shared,
            restart_tx,
            firmware_path,
            restart_delay: RESTART_DELAY,
        }
    }

    /// Hand the restart to the main loop after the response has gone out.
    fn schedule_restart(&self, request: RestartRequest) {
        let tx = self.restart_tx.clone();
        let delay = self.restart_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(request).is_err() {
                tracing::warn!(%request, "main loop gone, restart request dropped");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: OtaState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/reset", get(reset))
        .route("/update", get(update_form).post(upload))
        .route("/api/status", get(api_status))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

async fn index(State(state): State<OtaState>) -> Html<String> {
    let st = state.shared.read().await;
    Html(render_status(&st.to_status()))
}

async fn api_status(State(state): State<OtaState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn reset(State(state): State<OtaState>) -> Html<&'static str> {
    tracing::warn!("reset requested over http");
    state
        .shared
        .write()
        .await
        .record_system("reset requested over http".to_string());
    state.schedule_restart(RestartRequest::Reset);
    Html(RESET_HTML)
}

async fn update_form() -> Html<&'static str> {
    Html(UPDATE_FORM_HTML)
}

async fn upload(State(state): State<OtaState>, mut multipart: Multipart) -> Response {
    let image = match read_firmware_field(&mut multipart).await {
        Ok(Some(bytes)) if !bytes.is_empty() => bytes,
        Ok(_) => {
            return (StatusCode::BAD_REQUEST, "no firmware image in upload").into_response();
        }
        Err(e) => {
            tracing::warn!("bad firmware upload: {e}");
            return (StatusCode::BAD_REQUEST, format!("bad upload: {e}")).into_response();
        }
    };

    tracing::info!(bytes = image.len(), path = %state.firmware_path.display(), "installing firmware");

    if let Err(e) = install(&state.firmware_path, &image).await {
        tracing::error!("firmware install failed: {e:#}");
        state
            .shared
            .write()
            .await
            .record_error(format!("firmware install failed: {e:#}"));
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("update failed: {e:#}"))
            .into_response();
    }

    state
        .shared
        .write()
        .await
        .record_system(format!("firmware updated ({} bytes)", image.len()));
    state.schedule_restart(RestartRequest::FirmwareUpdated);
    Html(UPDATE_OK_HTML).into_response()
}

async fn read_firmware_field(
    multipart: &mut Multipart,
) -> Result<Option<axum::body::Bytes>, axum::extract::multipart::MultipartError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(FIRMWARE_FIELD) {
            return field.bytes().await.map(Some);
        }
    }
    Ok(None)
}

/// Write the image next to `path`, mark it executable and swap it in
/// atomically so a failed upload never leaves a half-written binary.
async fn install(path: &Path, image: &[u8]) -> Result<()> {
    let mut staging_name = path
        .file_name()
        .with_context(|| format!("firmware path has no file name: {}", path.display()))?
        .to_os_string();
    staging_name.push(".new");
    let staging = path.with_file_name(staging_name);

    tokio::fs::write(&staging, image)
        .await
        .with_context(|| format!("failed to write {}", staging.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755))
            .await
            .with_context(|| format!("failed to chmod {}", staging.display()))?;
    }

    tokio::fs::rename(&staging, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Pages
// ---------------------------------------------------------------------------

const RESET_HTML: &str = r#"<!DOCTYPE html>
<html><head><meta http-equiv="refresh" content="15;URL=/"><title>Restarting</title></head>
<body><p>Restarting&hellip; this page reloads in 15 seconds.</p></body></html>
"#;

const UPDATE_FORM_HTML: &str = r#"<!DOCTYPE html>
<html><head><title>Firmware update</title></head>
<body>
<h1>Firmware update</h1>
<form method="POST" action="/update" enctype="multipart/form-data">
<input type="file" name="firmware"> <input type="submit" value="Update">
</form>
<p><a href="/">Back</a></p>
</body></html>
"#;

const UPDATE_OK_HTML: &str = r#"<!DOCTYPE html>
<html><head><meta http-equiv="refresh" content="15;URL=/"><title>Updated</title></head>
<body><p>Update Success! Rebooting&hellip;</p></body></html>
"#;

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_status(status: &StatusResponse) -> String {
    let host = escape_html(&status.hostname);
    let serial = escape_html(status.serial_number.as_deref().unwrap_or("-"));
    let last_cycle = match &status.last_cycle {
        None => "none yet".to_string(),
        Some(c) => match c.read_error {
            Some(code) => format!("{}: sensor read failed (code {code})", c.ts),
            None => format!(
                "{}: {} published, {} rejected, {} failed, {} unavailable",
                c.ts,
                c.published,
                c.rejected,
                c.failed,
                c.skipped.len()
            ),
        },
    };
    let events: String = status
        .events
        .iter()
        .take(20)
        .map(|e| format!("<li>{} [{:?}] {}</li>\n", e.ts, e.kind, escape_html(&e.detail)))
        .collect();

    format!(
        r#"<!DOCTYPE html>
<html><head><title>{host}</title></head>
<body>
<h1>{host}</h1>
<table>
<tr><td>Serial number</td><td>{serial}</td></tr>
<tr><td>Uptime</td><td>{uptime} s</td></tr>
<tr><td>Link</td><td>{link}</td></tr>
<tr><td>Last cycle</td><td>{last_cycle}</td></tr>
<tr><td>Cycles</td><td>{cycles} ({read_failures} read failures)</td></tr>
<tr><td>Points</td><td>{points} published, {publish_failures} dropped</td></tr>
<tr><td>Free memory</td><td>{mem} kB</td></tr>
</table>
<p><a href="/update">Update firmware</a> | <a href="/reset">Reset</a> | <a href="/api/status">JSON</a></p>
<ul>
{events}</ul>
</body></html>
"#,
        uptime = status.uptime_secs,
        link = if status.link_up { "up" } else { "down" },
        cycles = status.counters.cycles,
        read_failures = status.counters.read_failures,
        points = status.counters.points_published,
        publish_failures = status.counters.publish_failures,
        mem = status.system.available_memory_bytes / 1024,
    )
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

/// Bind the listener and spawn the server onto the current runtime.
pub async fn spawn(port: u16, state: OtaState, max_upload_bytes: usize) -> Result<SocketAddr> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind update listener on {addr}"))?;
    let local = listener.local_addr()?;

    tracing::info!("update listener on http://{local}");

    let app = router(state, max_upload_bytes);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("update listener stopped: {e}");
        }
    });

    Ok(local)
}

/// Start the listener if possible.  Failing to start it is not fatal: the
/// node keeps sampling without remote reset or update, and the reason is
/// logged and recorded for the status page.
pub async fn start(
    port: u16,
    shared: SharedState,
    firmware_path: Option<PathBuf>,
    max_upload_bytes: usize,
) -> Option<UnboundedReceiver<RestartRequest>> {
    let firmware_path = match firmware_path.map_or_else(std::env::current_exe, Ok) {
        Ok(path) => path,
        Err(e) => {
            return disabled(&shared, format!("cannot locate running executable: {e}")).await;
        }
    };

    let (tx, rx) = unbounded_channel();
    let state = OtaState::new(shared.clone(), tx, firmware_path);
    match spawn(port, state, max_upload_bytes).await {
        Ok(_) => Some(rx),
        Err(e) => disabled(&shared, format!("{e:#}")).await,
    }
}

async fn disabled(
    shared: &SharedState,
    reason: String,
) -> Option<UnboundedReceiver<RestartRequest>> {
    tracing::error!("update listener disabled: {reason}");
    shared
        .write()
        .await
        .record_error(format!("update listener disabled: {reason}"));
    None
}

// ===========================================================================
// Tests
// ===========================================================================
