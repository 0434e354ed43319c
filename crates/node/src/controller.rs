//! Main cycle controller: samples the sensor once per period and publishes
//! every available channel.
//!
//! ```text
//! Idle ──[now - last_fire >= period]──▶ Sampling ──[channels done | read error]──▶ Idle
//! ```
//!
//! Every poll first checks the network link.  A lost link is not retried in
//! process: the controller restarts the device and association runs again
//! from a clean state.  The period counts from the last fire *attempt*, so a
//! failed read consumes its slot.

use std::time::Duration;

use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::blink::{BlinkDiscipline, Blinker, IndicatorPin};
use crate::network::Connectivity;
use crate::ota::RestartRequest;
use crate::publish::{PublishOutcome, Publisher};
use crate::sensor::{Channel, DeviceIdentity, SensorDriver};
use crate::state::SharedState;

/// How often the main loop polls the controller.
pub const LOOP_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// Waiting for the period to elapse.
    Idle,
    /// Reading the sensor and publishing.
    Sampling,
}

// ---------------------------------------------------------------------------
// Cycle timer
// ---------------------------------------------------------------------------

/// Single "last fired" timestamp.  The first check after construction fires.
pub struct CycleTimer {
    period: Duration,
    last_fired: Option<Instant>,
}

impl CycleTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_fired: None,
        }
    }

    /// Fire and record `now` if at least one period has passed.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        let due = self
            .last_fired
            .map_or(true, |last| now.saturating_duration_since(last) >= self.period);
        if due {
            self.last_fired = Some(now);
        }
        due
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Tally of one successful read-and-publish pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub published: usize,
    pub rejected: usize,
    pub failed: usize,
    /// Channels that were NaN and therefore not published.
    pub skipped: Vec<Channel>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Not due yet.
    Idle,
    /// The link was down; a restart was issued.
    Restarted,
    /// The sensor read failed; nothing was published.
    ReadFailed { code: u16 },
    Sampled(CycleReport),
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct CycleController<S, P, N, L> {
    sensor: S,
    publisher: P,
    network: N,
    blinker: Blinker<L>,
    discipline: BlinkDiscipline,
    identity: DeviceIdentity,
    timer: CycleTimer,
    state: CycleState,
    shared: SharedState,
}

impl<S, P, N, L> CycleController<S, P, N, L>
where
    S: SensorDriver,
    P: Publisher,
    N: Connectivity,
    L: IndicatorPin,
{
    /// Startup sequence: pulse the LED, resolve the device identity and put
    /// the sensor into continuous measurement.  A sensor that refuses to
    /// start is logged, not fatal; its reads will fail and be logged too.
    pub async fn init(
        mut sensor: S,
        publisher: P,
        network: N,
        mut blinker: Blinker<L>,
        discipline: BlinkDiscipline,
        period: Duration,
        shared: SharedState,
    ) -> Self {
        if discipline == BlinkDiscipline::PerCycle {
            blinker.blink();
        }

        let identity = DeviceIdentity::resolve(&mut sensor);

        let start = sensor.start_measurement();
        {
            let mut st = shared.write().await;
            st.record_identity(identity.as_str());
            if let Err(e) = &start {
                error!(code = e.code(), "error trying to start measurement: {e}");
                st.record_error(format!("start measurement failed (code {}): {e}", e.code()));
            }
        }

        info!(
            serial_number = %identity,
            period_s = period.as_secs(),
            discipline = ?discipline,
            "cycle controller ready"
        );

        Self {
            sensor,
            publisher,
            network,
            blinker,
            discipline,
            identity,
            timer: CycleTimer::new(period),
            state: CycleState::Idle,
            shared,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// One main-loop iteration.
    pub async fn poll(&mut self, now: Instant) -> PollOutcome {
        let link_up = self.network.is_connected();
        self.shared.write().await.link_up = link_up;

        if !link_up {
            error!("network link lost");
            self.restart("network link lost").await;
            return PollOutcome::Restarted;
        }

        if self.discipline == BlinkDiscipline::Heartbeat {
            self.blinker.update(now);
        }

        if !self.timer.fire_if_due(now) {
            return PollOutcome::Idle;
        }

        self.state = CycleState::Sampling;
        let outcome = self.sample().await;
        self.state = CycleState::Idle;
        outcome
    }

    /// Restart through the connectivity escape hatch.
    pub async fn restart(&mut self, reason: &str) {
        self.shared
            .write()
            .await
            .record_system(format!("restart: {reason}"));
        self.network.restart(reason);
    }

    /// Honour at most one pending request from the update listener.  The
    /// receiver is dropped once the listener has gone away.
    pub async fn service_restart_requests(
        &mut self,
        requests: &mut Option<UnboundedReceiver<RestartRequest>>,
    ) {
        let Some(rx) = requests.as_mut() else {
            return;
        };
        match rx.try_recv() {
            Ok(request) => self.restart(&request.to_string()).await,
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                error!("update listener stopped, remote restart unavailable");
                *requests = None;
            }
        }
    }

    async fn sample(&mut self) -> PollOutcome {
        if self.discipline == BlinkDiscipline::PerCycle {
            self.blinker.blink();
        }

        info!("reading sensor");
        let measurements = match self.sensor.read_measured_values() {
            Ok(m) => m,
            Err(e) => {
                let code = e.code();
                error!(code, "error trying to read measured values: {e}");
                self.shared
                    .write()
                    .await
                    .record_read_failure(code, &e.to_string());
                return PollOutcome::ReadFailed { code };
            }
        };

        let mut report = CycleReport::default();
        for (channel, value) in measurements.iter() {
            if value.is_nan() {
                info!(channel = channel.label(), "n/a");
                report.skipped.push(channel);
                continue;
            }

            info!(channel = channel.label(), value);
            match self
                .publisher
                .publish(&self.identity, channel.metric_name(), value)
                .await
            {
                PublishOutcome::Accepted(_) => report.published += 1,
                PublishOutcome::Rejected(_) => report.rejected += 1,
                PublishOutcome::TransportFailed => report.failed += 1,
            }
        }

        if report.rejected + report.failed > 0 {
            warn!(
                rejected = report.rejected,
                failed = report.failed,
                "some points were dropped this cycle"
            );
        }

        self.shared.write().await.record_cycle(&report);
        PollOutcome::Sampled(report)
    }

    #[cfg(test)]
    pub(crate) fn blinker(&self) -> &Blinker<L> {
        &self.blinker
    }
}

// ===========================================================================
// Tests
// ===========================================================================
