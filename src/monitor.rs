//! Alarm stream subscription.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use crate::alarm::{AlarmEvent, DEFAULT_ALARM_CODE};
use crate::camera::Camera;
use crate::capture::{CaptureGate, CaptureOutcome};
use crate::storage::IncidentStore;

/// Counters for one stream session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub lines: u64,
    pub alarms: u64,
    pub captures: u64,
}

pub struct EventMonitor<S: IncidentStore> {
    camera: Arc<dyn Camera>,
    gate: Arc<CaptureGate<S>>,
    alarm_code: String,
    shutdown: Arc<AtomicBool>,
}

impl<S: IncidentStore> EventMonitor<S> {
    pub fn new(camera: Arc<dyn Camera>, gate: Arc<CaptureGate<S>>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            camera,
            gate,
            alarm_code: DEFAULT_ALARM_CODE.to_string(),
            shutdown,
        }
    }

    pub fn with_alarm_code(mut self, code: &str) -> Self {
        self.alarm_code = code.to_string();
        self
    }

    /// Hold one stream connection open and capture on every matching alarm.
    ///
    /// Returns `Err` when the connection cannot be opened or breaks, and
    /// `Ok` when the camera ends the stream or shutdown was requested. Either way
    /// the caller decides whether to reconnect.
    pub fn run(&self) -> Result<StreamStats> {
        log::info!(
            "connecting to camera alarm stream (code={})",
            self.alarm_code
        );
        let reader = self
            .camera
            .open_event_stream(&[self.alarm_code.as_str()])
            .context("open alarm stream")?;
        log::info!("alarm stream connected");

        let stats = self.consume(reader)?;
        log::warn!(
            "alarm stream ended after {} lines, {} alarms, {} captures",
            stats.lines,
            stats.alarms,
            stats.captures
        );
        Ok(stats)
    }

    /// Process lines from an already open stream.
    pub fn consume(&self, reader: Box<dyn BufRead + Send>) -> Result<StreamStats> {
        let mut stats = StreamStats::default();
        for line in reader.lines() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let line = line.map_err(|e| anyhow!("alarm stream read failed: {}", e))?;
            stats.lines += 1;
            if line.trim().is_empty() {
                continue;
            }
            let Some(event) = AlarmEvent::parse(&line) else {
                continue;
            };
            if !event.is(&self.alarm_code) {
                log::debug!("ignoring event {}", event.code);
                continue;
            }

            stats.alarms += 1;
            log::info!(
                "tripwire alarm: code={} action={} index={}",
                event.code,
                event.action.as_deref().unwrap_or("-"),
                event
                    .index
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            if let CaptureOutcome::Stored { .. } = self.gate.capture() {
                stats.captures += 1;
            }
        }
        Ok(stats)
    }
}
