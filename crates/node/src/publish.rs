//! InfluxDB line-protocol publisher.
//!
//! Every point is one HTTP/1.1 POST on a fresh TCP connection:
//!
//! ```text
//! POST /write?db=<database>
//! <measurement>,serial_number=<id> value=<float>
//! ```
//!
//! There is no retry and no queue; the next cycle's reading supersedes a
//! dropped one.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{header, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::sensor::DeviceIdentity;

/// Result of a single publish.  Failures are logged, never propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Server answered 2xx.
    Accepted(u16),
    /// Server answered with any other status.
    Rejected(u16),
    /// No usable answer: connect, IO or timeout failure.
    TransportFailed,
}

/// Sink for single scalar measurements.
pub trait Publisher {
    fn publish(
        &self,
        identity: &DeviceIdentity,
        metric: &'static str,
        value: f32,
    ) -> impl Future<Output = PublishOutcome>;
}

// ---------------------------------------------------------------------------
// Line protocol
// ---------------------------------------------------------------------------

/// Escape a tag value: commas, equals signs and spaces are significant.
fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// One point, one field, no timestamp (the server stamps it on ingest).
pub fn line(metric: &str, serial_number: &str, value: f32) -> String {
    format!(
        "{metric},serial_number={} value={value}",
        escape_tag(serial_number)
    )
}

// ---------------------------------------------------------------------------
// HTTP publisher
// ---------------------------------------------------------------------------

pub struct InfluxPublisher {
    host: String,
    port: u16,
    database: String,
    timeout: Duration,
}

impl InfluxPublisher {
    pub fn new(host: &str, port: u16, database: &str, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            database: database.to_string(),
            timeout,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.path())
    }

    fn path(&self) -> String {
        format!("/write?db={}", self.database)
    }

    /// POST `body` on a connection that lives only for this call.
    async fn post(&self, body: String) -> Result<StatusCode> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("connect {}:{}", self.host, self.port))?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("http handshake")?;
        let conn = tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("influx connection closed with error: {e}");
            }
        });

        let req = Request::post(self.path())
            .header(header::HOST, format!("{}:{}", self.host, self.port))
            .header(header::ACCEPT, "*/*")
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(header::CONNECTION, "close")
            .body(Full::new(Bytes::from(body)))
            .context("build request")?;

        let res = sender.send_request(req).await.context("send request")?;
        let status = res.status();

        // Drain so the connection can shut down cleanly.
        match res.into_body().collect().await {
            Ok(body) if !status.is_success() => {
                let text = String::from_utf8_lossy(&body.to_bytes()).into_owned();
                tracing::debug!(status = status.as_u16(), body = %text.trim(), "influx response");
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("failed to read influx response body: {e}"),
        }

        drop(sender);
        let _ = conn.await;
        Ok(status)
    }
}

impl Publisher for InfluxPublisher {
    async fn publish(
        &self,
        identity: &DeviceIdentity,
        metric: &'static str,
        value: f32,
    ) -> PublishOutcome {
        let body = line(metric, identity.as_str(), value);
        tracing::debug!(url = %self.url(), %body, "[HTTP] POST");

        match tokio::time::timeout(self.timeout, self.post(body)).await {
            Ok(Ok(status)) if status.is_success() => {
                tracing::info!(metric, value, code = status.as_u16(), "[HTTP] POST ok");
                PublishOutcome::Accepted(status.as_u16())
            }
            Ok(Ok(status)) => {
                tracing::warn!(metric, value, code = status.as_u16(), "[HTTP] POST rejected");
                PublishOutcome::Rejected(status.as_u16())
            }
            Ok(Err(e)) => {
                tracing::error!(metric, "[HTTP] POST failed, error: {e:#}");
                PublishOutcome::TransportFailed
            }
            Err(_) => {
                tracing::error!(
                    metric,
                    timeout_s = self.timeout.as_secs_f32(),
                    "[HTTP] POST failed, error: timed out"
                );
                PublishOutcome::TransportFailed
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{RawQuery, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::Router;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    type Captured = Arc<Mutex<Vec<(Option<String>, String)>>>;

    /// Start an in-process fake InfluxDB answering every write with `status`.
    async fn fake_influx(status: AxumStatus) -> (u16, Captured) {
        let captured: Captured = Arc::default();

        async fn write(
            State((status, captured)): State<(AxumStatus, Captured)>,
            RawQuery(query): RawQuery,
            body: String,
        ) -> AxumStatus {
            captured.lock().unwrap().push((query, body));
            status
        }

        let app = Router::new()
            .route("/write", post(write))
            .with_state((status, Arc::clone(&captured)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (port, captured)
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity::from_raw("F00DCAFE")
    }

    // -- Line protocol ------------------------------------------------------

    #[test]
    fn line_has_measurement_tag_and_field() {
        assert_eq!(
            line("temperature", "F00DCAFE", 21.5),
            "temperature,serial_number=F00DCAFE value=21.5"
        );
    }

    #[test]
    fn line_uses_shortest_float() {
        assert_eq!(
            line("mass_concentration_pm_1_0", "X", 12.3),
            "mass_concentration_pm_1_0,serial_number=X value=12.3"
        );
    }

    #[test]
    fn tag_values_are_escaped() {
        assert_eq!(escape_tag("a b,c=d"), r"a\ b\,c\=d");
        assert_eq!(
            line("humidity", "my sensor", 40.0),
            r"humidity,serial_number=my\ sensor value=40"
        );
    }

    #[test]
    fn url_includes_database() {
        let p = InfluxPublisher::new("cube.local", 8086, "vindstyrka", Duration::from_secs(5));
        assert_eq!(p.url(), "http://cube.local:8086/write?db=vindstyrka");
    }

    // -- HTTP ---------------------------------------------------------------

    #[tokio::test]
    async fn no_content_is_accepted() {
        let (port, captured) = fake_influx(AxumStatus::NO_CONTENT).await;
        let p = InfluxPublisher::new("127.0.0.1", port, "vindstyrka", Duration::from_secs(5));

        let outcome = p.publish(&identity(), "temperature", 21.5).await;

        assert_eq!(outcome, PublishOutcome::Accepted(204));
        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0.as_deref(), Some("db=vindstyrka"));
        assert_eq!(captured[0].1, "temperature,serial_number=F00DCAFE value=21.5");
    }

    #[tokio::test]
    async fn each_publish_is_one_request() {
        let (port, captured) = fake_influx(AxumStatus::NO_CONTENT).await;
        let p = InfluxPublisher::new("127.0.0.1", port, "db", Duration::from_secs(5));

        p.publish(&identity(), "humidity", 40.0).await;
        p.publish(&identity(), "voc_index", 100.0).await;

        assert_eq!(captured.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn server_error_is_rejected_not_retried() {
        let (port, captured) = fake_influx(AxumStatus::INTERNAL_SERVER_ERROR).await;
        let p = InfluxPublisher::new("127.0.0.1", port, "db", Duration::from_secs(5));

        let outcome = p.publish(&identity(), "nox_index", 1.0).await;

        assert_eq!(outcome, PublishOutcome::Rejected(500));
        assert_eq!(captured.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_port_is_transport_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let p = InfluxPublisher::new("127.0.0.1", port, "db", Duration::from_secs(5));
        let outcome = p.publish(&identity(), "temperature", 20.0).await;

        assert_eq!(outcome, PublishOutcome::TransportFailed);
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        // Accepts connections but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((sock, _)) = listener.accept().await {
                    held.push(sock);
                }
            }
        });

        let p = InfluxPublisher::new("127.0.0.1", port, "db", Duration::from_millis(200));
        let outcome = p.publish(&identity(), "temperature", 20.0).await;

        assert_eq!(outcome, PublishOutcome::TransportFailed);
    }
}
