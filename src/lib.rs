//! Tripwire Inspector
//!
//! Watches a camera's line-crossing alarm stream, captures a snapshot when an alarm
//! fires, and inspects every capture with several object detectors to find missing
//! safety equipment. Only captures that show a violation become incidents.
//!
//! # Architecture
//!
//! Two independent loops share nothing but the incident store:
//!
//! 1. **Producer**: `EventMonitor` reads the alarm stream and calls
//!    `CaptureGate::capture`, which enforces the cooldown and appends raw captures.
//! 2. **Consumer**: `DetectionConsumer` polls for captures after its durable cursor,
//!    fans each one out to the `DetectorRegistry`, applies an `AggregationPolicy`,
//!    and commits the inspection (plus an annotated incident on violation).
//!
//! # Module Structure
//!
//! - `camera`: camera HTTP API (event stream, snapshots, digest auth)
//! - `alarm`: alarm stream line parsing
//! - `capture`: cooldown gate
//! - `monitor`: alarm stream subscription
//! - `detect`: detector backends and registry
//! - `policy`: violation aggregation rules
//! - `annotate`: overlay rendering for incidents
//! - `storage`: capture/incident logs and consumer cursor
//! - `consumer`: detection loop
//! - `supervisor`: restart-with-backoff for long-running tasks

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod alarm;
pub mod annotate;
pub mod camera;
pub mod capture;
pub mod config;
pub mod consumer;
pub mod detect;
pub mod monitor;
pub mod policy;
pub mod storage;
pub mod supervisor;

pub use alarm::AlarmEvent;
pub use camera::{Camera, Credentials, DahuaCamera};
pub use capture::{CaptureGate, CaptureOutcome, Clock, ManualClock, SystemClock};
pub use consumer::{ConsumerSettings, DetectionConsumer, PollSummary};
pub use detect::{
    BoundingBox, DetectionResult, Detector, DetectorRegistry, LabeledDetection, RawDetection,
    StubDetector,
};
pub use monitor::EventMonitor;
pub use policy::{AggregationPolicy, NegativeMarkerPolicy, QuorumPolicy, Verdict};
pub use storage::{
    CapturedImage, Incident, IncidentStore, InMemoryIncidentStore, Inspection, InspectionRecord,
    InspectionStatus, NewIncident, SqliteIncidentStore,
};
pub use supervisor::{supervise, Backoff};

/// Unique shared-cache in-memory database URI, so several connections in one
/// process see the same data.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:tripwire_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub(crate) fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}
