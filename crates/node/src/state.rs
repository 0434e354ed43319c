use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use sysinfo::System;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::controller::CycleReport;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<StationState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct StationState {
    pub started_at: Instant,
    pub hostname: String,
    pub serial_number: Option<String>,
    pub link_up: bool,
    pub last_cycle: Option<CycleSummary>,
    pub counters: Counters,
    pub events: VecDeque<StationEvent>,
}

#[derive(Clone, Serialize)]
pub struct CycleSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    /// `None` when the read succeeded.
    pub read_error: Option<u16>,
    pub published: usize,
    pub rejected: usize,
    pub failed: usize,
    pub skipped: Vec<&'static str>,
}

#[derive(Clone, Default, Serialize)]
pub struct Counters {
    pub cycles: u64,
    pub read_failures: u64,
    pub points_published: u64,
    pub publish_failures: u64,
}

#[derive(Clone, Serialize)]
pub struct StationEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Cycle,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub hostname: String,
    pub serial_number: Option<String>,
    pub uptime_secs: u64,
    pub link_up: bool,
    pub last_cycle: Option<CycleSummary>,
    pub counters: Counters,
    pub system: SystemInfo,
    pub events: Vec<StationEvent>,
}

#[derive(Serialize)]
pub struct SystemInfo {
    pub host_uptime_secs: u64,
    pub available_memory_bytes: u64,
}

impl SystemInfo {
    fn sample() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        Self {
            host_uptime_secs: System::uptime(),
            available_memory_bytes: sys.available_memory(),
        }
    }
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl StationState {
    pub fn new(hostname: &str) -> Self {
        Self {
            started_at: Instant::now(),
            hostname: hostname.to_string(),
            serial_number: None,
            link_up: false,
            last_cycle: None,
            counters: Counters::default(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(hostname: &str) -> SharedState {
        Arc::new(RwLock::new(Self::new(hostname)))
    }

    /// Record the identity resolved at startup.
    pub fn record_identity(&mut self, serial_number: &str) {
        self.serial_number = Some(serial_number.to_string());
        self.push_event(EventKind::System, format!("serial number {serial_number}"));
    }

    /// Record a completed sampling pass.
    pub fn record_cycle(&mut self, report: &CycleReport) {
        self.counters.cycles += 1;
        self.counters.points_published += report.published as u64;
        self.counters.publish_failures += (report.rejected + report.failed) as u64;

        let detail = format!(
            "published {}, rejected {}, failed {}, skipped [{}]",
            report.published,
            report.rejected,
            report.failed,
            report
                .skipped
                .iter()
                .map(|c| c.metric_name())
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.last_cycle = Some(CycleSummary {
            ts: OffsetDateTime::now_utc(),
            read_error: None,
            published: report.published,
            rejected: report.rejected,
            failed: report.failed,
            skipped: report.skipped.iter().map(|c| c.metric_name()).collect(),
        });

        self.push_event(EventKind::Cycle, detail);
    }

    /// Record a sampling pass whose sensor read failed.
    pub fn record_read_failure(&mut self, code: u16, message: &str) {
        self.counters.cycles += 1;
        self.counters.read_failures += 1;
        self.last_cycle = Some(CycleSummary {
            ts: OffsetDateTime::now_utc(),
            read_error: Some(code),
            published: 0,
            rejected: 0,
            failed: 0,
            skipped: Vec::new(),
        });
        self.push_event(
            EventKind::Error,
            format!("sensor read failed (code {code}): {message}"),
        );
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            hostname: self.hostname.clone(),
            serial_number: self.serial_number.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            link_up: self.link_up,
            last_cycle: self.last_cycle.clone(),
            counters: self.counters.clone(),
            system: SystemInfo::sample(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(StationEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
