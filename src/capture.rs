//! Capture gate: cooldown-limited snapshot capture.
//!
//! The time of the last successful capture lives inside the gate, behind the same
//! mutex as the store handle. The cooldown check, the snapshot fetch and the store
//! append run under that one lock, so overlapping callers cannot both pass the
//! check inside one cooldown window.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::camera::Camera;
use crate::storage::IncidentStore;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(20);

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Local>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Local>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock_or_recover(&self.now);
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *lock_or_recover(&self.now)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Snapshot stored as a new raw capture.
    Stored { id: i64 },
    /// Inside the cooldown window; the camera was not contacted.
    CoolingDown { remaining: Duration },
    /// Snapshot or store append failed. Cooldown unchanged.
    Failed { reason: String },
}

struct GateState<S> {
    last_capture: Option<DateTime<Local>>,
    store: S,
}

pub struct CaptureGate<S: IncidentStore> {
    camera: Arc<dyn Camera>,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
    state: Mutex<GateState<S>>,
}

impl<S: IncidentStore> CaptureGate<S> {
    pub fn new(camera: Arc<dyn Camera>, clock: Arc<dyn Clock>, cooldown: Duration, store: S) -> Self {
        Self {
            camera,
            clock,
            cooldown,
            state: Mutex::new(GateState {
                last_capture: None,
                store,
            }),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn last_capture(&self) -> Option<DateTime<Local>> {
        lock_or_recover(&self.state).last_capture
    }

    /// Capture one snapshot unless still cooling down. Never fails: problems are
    /// logged and reported as `Failed`.
    pub fn capture(&self) -> CaptureOutcome {
        let mut state = lock_or_recover(&self.state);
        let now = self.clock.now();

        if let Some(last) = state.last_capture {
            // A clock that stepped backwards yields a negative span; let it through.
            if let Ok(elapsed) = (now - last).to_std() {
                if elapsed < self.cooldown {
                    let remaining = self.cooldown - elapsed;
                    log::info!(
                        "capture skipped: cooling down ({:.1}s left)",
                        remaining.as_secs_f32()
                    );
                    return CaptureOutcome::CoolingDown { remaining };
                }
            }
        }

        let image = match self.camera.snapshot() {
            Ok(image) => image,
            Err(e) => {
                log::warn!("snapshot failed: {:#}", e);
                return CaptureOutcome::Failed {
                    reason: format!("{:#}", e),
                };
            }
        };

        let taken_at = self.clock.now();
        let date = taken_at.format("%Y-%m-%d").to_string();
        let time = taken_at.format("%H:%M:%S").to_string();
        match state.store.append_capture(&date, &time, &image) {
            Ok(id) => {
                state.last_capture = Some(now);
                log::info!(
                    "capture {} stored ({} bytes, {} {})",
                    id,
                    image.len(),
                    date,
                    time
                );
                CaptureOutcome::Stored { id }
            }
            Err(e) => {
                log::error!("failed to store capture: {:#}", e);
                CaptureOutcome::Failed {
                    reason: format!("{:#}", e),
                }
            }
        }
    }
}

// A panic while holding the lock leaves a consistent timestamp, so keep going.
fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
