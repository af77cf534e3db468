//! Detection consumer.
//!
//! Polls the capture log after its cursor, runs every registered detector on each
//! capture and commits exactly one inspection per capture. The cursor moves past a
//! capture before it is judged, so a capture that fails in any way is never
//! retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::annotate::{encode_jpeg, render_overlay};
use crate::detect::{DetectionResult, DetectorRegistry};
use crate::policy::AggregationPolicy;
use crate::storage::{CapturedImage, IncidentStore, Inspection, InspectionStatus, NewIncident};
use crate::supervisor::sleep_unless_shutdown;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_BATCH_SIZE: usize = 64;
const DEFAULT_JPEG_QUALITY: u8 = 90;

/// What to do when more captures are waiting than `max_backlog`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BacklogPolicy {
    /// Warn once per episode and keep processing everything.
    Alert,
    /// Mark the oldest excess captures `Dropped` without inspecting them.
    DropOldest,
}

impl BacklogPolicy {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "alert" => Ok(BacklogPolicy::Alert),
            "drop_oldest" => Ok(BacklogPolicy::DropOldest),
            other => Err(anyhow!(
                "unknown backlog policy '{}'; expected alert or drop_oldest",
                other
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsumerSettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_backlog: Option<u64>,
    pub backlog_policy: BacklogPolicy,
    pub jpeg_quality: u8,
    pub box_thickness: u32,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            max_backlog: None,
            backlog_policy: BacklogPolicy::Alert,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            box_thickness: 2,
        }
    }
}

/// Outcome counts for one poll.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub processed: u64,
    pub clean: u64,
    pub flagged: u64,
    pub uninspectable: u64,
    pub dropped: u64,
}

impl PollSummary {
    fn record(&mut self, status: InspectionStatus) {
        self.processed += 1;
        match status {
            InspectionStatus::Clean => self.clean += 1,
            InspectionStatus::Flagged => self.flagged += 1,
            InspectionStatus::Uninspectable => self.uninspectable += 1,
            InspectionStatus::Dropped => self.dropped += 1,
        }
    }
}

pub struct DetectionConsumer<S: IncidentStore> {
    store: S,
    registry: DetectorRegistry,
    policy: Box<dyn AggregationPolicy>,
    settings: ConsumerSettings,
    last_processed_id: i64,
    backlog_warned: bool,
}

impl<S: IncidentStore> DetectionConsumer<S> {
    /// Resume from the durable cursor. Without one, start after the newest capture
    /// already in the store and persist that starting point.
    pub fn new(
        mut store: S,
        registry: DetectorRegistry,
        policy: Box<dyn AggregationPolicy>,
        settings: ConsumerSettings,
    ) -> Result<Self> {
        if settings.batch_size == 0 {
            return Err(anyhow!("consumer batch size must be at least 1"));
        }
        let last_processed_id = match store.load_cursor()? {
            Some(id) => {
                log::info!("detection consumer resuming after capture {}", id);
                id
            }
            None => {
                let id = store.max_capture_id()?;
                store.save_cursor(id)?;
                log::info!(
                    "detection consumer has no cursor; starting after capture {}",
                    id
                );
                id
            }
        };
        if registry.is_empty() {
            log::warn!("no detectors registered; every capture will be judged clean");
        }
        Ok(Self {
            store,
            registry,
            policy,
            settings,
            last_processed_id,
            backlog_warned: false,
        })
    }

    pub fn last_processed_id(&self) -> i64 {
        self.last_processed_id
    }

    /// Poll until `shutdown` is set. Store errors end the run so the caller can
    /// back off and restart it.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        log::info!(
            "detection consumer running: detectors={:?} policy={} poll={:?}",
            self.registry.names(),
            self.policy.name(),
            self.settings.poll_interval
        );
        while !shutdown.load(Ordering::SeqCst) {
            let summary = self.poll_once()?;
            if summary.processed == 0 {
                sleep_unless_shutdown(shutdown, self.settings.poll_interval);
            } else {
                log::info!(
                    "inspected {} captures: {} clean, {} flagged, {} uninspectable, {} dropped",
                    summary.processed,
                    summary.clean,
                    summary.flagged,
                    summary.uninspectable,
                    summary.dropped
                );
            }
        }
        Ok(())
    }

    /// Process at most one batch of pending captures.
    pub fn poll_once(&mut self) -> Result<PollSummary> {
        let mut summary = PollSummary::default();
        self.enforce_backlog(&mut summary)?;

        let captures = self
            .store
            .captures_after(self.last_processed_id, self.settings.batch_size)?;
        for capture in captures {
            let status = self.process_capture(capture);
            summary.record(status);
        }
        Ok(summary)
    }

    fn process_capture(&mut self, capture: CapturedImage) -> InspectionStatus {
        self.last_processed_id = capture.id;
        let inspection = self.inspect(&capture);
        self.commit(inspection)
    }

    fn inspect(&self, capture: &CapturedImage) -> Inspection {
        let image = match image::load_from_memory(&capture.image) {
            Ok(image) => image.to_rgb8(),
            Err(e) => {
                log::warn!("capture {}: cannot decode image: {}", capture.id, e);
                return Inspection {
                    capture_id: capture.id,
                    status: InspectionStatus::Uninspectable,
                    detail: Some(format!("decode failed: {}", e)),
                    incident: None,
                };
            }
        };

        let mut results: Vec<DetectionResult> = Vec::with_capacity(self.registry.len());
        let mut failures = Vec::new();
        for (name, outcome) in self.registry.classify_all(&image) {
            match outcome {
                Ok(result) => {
                    log::info!(
                        "capture {}: {} -> {:?}",
                        capture.id,
                        name,
                        result.labels()
                    );
                    results.push(result);
                }
                Err(e) => {
                    log::warn!("capture {}: detector {} failed: {:#}", capture.id, name, e);
                    failures.push(format!("{}: {:#}", name, e));
                }
            }
        }
        let failure_detail = (!failures.is_empty()).then(|| failures.join("; "));

        let verdict = self.policy.evaluate(&results);
        if !verdict.violation {
            return match failure_detail {
                Some(detail) => Inspection {
                    capture_id: capture.id,
                    status: InspectionStatus::Uninspectable,
                    detail: Some(detail),
                    incident: None,
                },
                None => Inspection {
                    capture_id: capture.id,
                    status: InspectionStatus::Clean,
                    detail: None,
                    incident: None,
                },
            };
        }

        let labels: Vec<String> = verdict.findings.iter().map(|f| f.tag()).collect();
        log::warn!("capture {}: violation {:?}", capture.id, labels);
        let overlay = render_overlay(
            &image,
            &results,
            |label| self.policy.is_negative(label),
            self.settings.box_thickness,
        );
        match encode_jpeg(&overlay, self.settings.jpeg_quality) {
            Ok(annotated) => Inspection {
                capture_id: capture.id,
                status: InspectionStatus::Flagged,
                detail: failure_detail,
                incident: Some(NewIncident {
                    capture_id: capture.id,
                    date: capture.date.clone(),
                    time: capture.time.clone(),
                    image: annotated,
                    labels,
                }),
            },
            Err(e) => {
                log::error!("capture {}: cannot encode incident image: {:#}", capture.id, e);
                Inspection {
                    capture_id: capture.id,
                    status: InspectionStatus::Dropped,
                    detail: Some(format!("incident encode failed: {:#}", e)),
                    incident: None,
                }
            }
        }
    }

    /// Commit an inspection. A failed incident write degrades to `Dropped`; the
    /// capture is not retried either way.
    fn commit(&mut self, inspection: Inspection) -> InspectionStatus {
        let capture_id = inspection.capture_id;
        let err = match self.store.commit_inspection(&inspection) {
            Ok(Some(incident_id)) => {
                log::info!("capture {}: incident {} recorded", capture_id, incident_id);
                return inspection.status;
            }
            Ok(None) => {
                log::debug!("capture {}: {}", capture_id, inspection.status.as_str());
                return inspection.status;
            }
            Err(e) => e,
        };

        if inspection.incident.is_none() {
            log::error!(
                "capture {}: failed to record {} inspection: {:#}",
                capture_id,
                inspection.status.as_str(),
                err
            );
            self.save_cursor_after_failure(capture_id);
            return inspection.status;
        }

        log::error!("capture {}: failed to write incident: {:#}", capture_id, err);
        let dropped = Inspection {
            capture_id,
            status: InspectionStatus::Dropped,
            detail: Some(format!("incident write failed: {:#}", err)),
            incident: None,
        };
        if let Err(e) = self.store.commit_inspection(&dropped) {
            log::error!("capture {}: failed to record drop: {:#}", capture_id, e);
            self.save_cursor_after_failure(capture_id);
        }
        InspectionStatus::Dropped
    }

    /// The in-memory cursor has already moved past `capture_id`; keep the stored
    /// one in step even though the inspection row is missing.
    fn save_cursor_after_failure(&mut self, capture_id: i64) {
        if let Err(e) = self.store.save_cursor(capture_id) {
            log::error!(
                "capture {}: cursor not saved; it will be inspected again after a restart: {:#}",
                capture_id,
                e
            );
        }
    }

    fn enforce_backlog(&mut self, summary: &mut PollSummary) -> Result<()> {
        let Some(max_backlog) = self.settings.max_backlog else {
            return Ok(());
        };
        let pending = self.store.count_captures_after(self.last_processed_id)?;
        if pending <= max_backlog {
            self.backlog_warned = false;
            return Ok(());
        }

        match self.settings.backlog_policy {
            BacklogPolicy::Alert => {
                if !self.backlog_warned {
                    log::warn!(
                        "{} captures waiting for inspection (limit {})",
                        pending,
                        max_backlog
                    );
                    self.backlog_warned = true;
                }
            }
            BacklogPolicy::DropOldest => {
                let excess = (pending - max_backlog) as usize;
                log::warn!(
                    "{} captures waiting (limit {}); dropping the oldest {}",
                    pending,
                    max_backlog,
                    excess
                );
                let mut remaining = excess;
                while remaining > 0 {
                    let chunk = remaining.min(self.settings.batch_size);
                    let ids = self.store.capture_ids_after(self.last_processed_id, chunk)?;
                    if ids.is_empty() {
                        break;
                    }
                    remaining -= ids.len();
                    for capture_id in ids {
                        self.last_processed_id = capture_id;
                        let status = self.commit(Inspection {
                            capture_id,
                            status: InspectionStatus::Dropped,
                            detail: Some("backlog limit exceeded".to_string()),
                            incident: None,
                        });
                        summary.record(status);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubDetector;
    use crate::policy::NegativeMarkerPolicy;
    use crate::storage::{CapturedImage, InMemoryIncidentStore, Incident, InspectionRecord};
    use image::{Rgb, RgbImage};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn jpeg() -> Vec<u8> {
        encode_jpeg(&RgbImage::from_pixel(32, 32, Rgb([90, 90, 90])), 90).unwrap()
    }

    fn ppe_vocabulary() -> Vec<String> {
        ["Hardhat", "NO-Hardhat", "Safety Vest", "NO-Safety Vest"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn gloves_vocabulary() -> Vec<String> {
        vec!["Gloves".to_string(), "No-Gloves".to_string()]
    }

    fn consumer_with(
        store: &InMemoryIncidentStore,
        registry: DetectorRegistry,
        settings: ConsumerSettings,
    ) -> DetectionConsumer<InMemoryIncidentStore> {
        DetectionConsumer::new(
            store.clone(),
            registry,
            Box::new(NegativeMarkerPolicy::default()),
            settings,
        )
        .unwrap()
    }

    fn registry(ppe_classes: &[usize], gloves_classes: &[usize]) -> DetectorRegistry {
        let mut registry = DetectorRegistry::new();
        registry
            .register(
                "gloves",
                StubDetector::with_classes(gloves_classes),
                gloves_vocabulary(),
                None,
            )
            .unwrap();
        registry
            .register("ppe", StubDetector::with_classes(ppe_classes), ppe_vocabulary(), None)
            .unwrap();
        registry
    }

    fn inspection(store: &mut InMemoryIncidentStore, id: i64) -> InspectionRecord {
        store.inspection(id).unwrap().expect("inspection recorded")
    }

    #[test]
    fn clean_capture_writes_no_incident_and_advances_cursor() {
        let mut store = InMemoryIncidentStore::new();
        let mut consumer = consumer_with(&store, registry(&[0, 2], &[0]), ConsumerSettings::default());
        let id = store.append_capture("2025-03-01", "08:00:00", &jpeg()).unwrap();

        let summary = consumer.poll_once().unwrap();
        assert_eq!(summary.clean, 1);
        assert_eq!(consumer.last_processed_id(), id);
        assert!(store.incidents_after(0, 10).unwrap().is_empty());
        assert_eq!(inspection(&mut store, id).status, InspectionStatus::Clean);
        assert_eq!(store.load_cursor().unwrap(), Some(id));
    }

    #[test]
    fn violation_writes_annotated_incident_with_capture_time() {
        let mut store = InMemoryIncidentStore::new();
        let mut consumer = consumer_with(&store, registry(&[1, 2], &[1]), ConsumerSettings::default());
        let id = store.append_capture("2025-03-01", "08:15:42", &jpeg()).unwrap();

        let summary = consumer.poll_once().unwrap();
        assert_eq!(summary.flagged, 1);

        let incidents: Vec<Incident> = store.incidents_after(0, 10).unwrap();
        assert_eq!(incidents.len(), 1);
        let incident = &incidents[0];
        assert_eq!(incident.capture_id, id);
        assert_eq!((incident.date.as_str(), incident.time.as_str()), ("2025-03-01", "08:15:42"));
        assert_eq!(incident.labels, vec!["gloves:No-Gloves", "ppe:NO-Hardhat"]);
        let decoded = image::load_from_memory(&incident.image).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 32));

        let record = inspection(&mut store, id);
        assert_eq!(record.status, InspectionStatus::Flagged);
        assert_eq!(record.incident_id, Some(incident.id));
    }

    #[test]
    fn undecodable_capture_is_uninspectable() {
        let mut store = InMemoryIncidentStore::new();
        let mut consumer = consumer_with(&store, registry(&[1], &[1]), ConsumerSettings::default());
        let id = store.append_capture("2025-03-01", "08:00:00", b"not a jpeg").unwrap();

        let summary = consumer.poll_once().unwrap();
        assert_eq!(summary.uninspectable, 1);
        assert!(store.incidents_after(0, 10).unwrap().is_empty());
        let record = inspection(&mut store, id);
        assert_eq!(record.status, InspectionStatus::Uninspectable);
        assert!(record.detail.unwrap().starts_with("decode failed"));
        assert_eq!(consumer.last_processed_id(), id);
    }

    #[test]
    fn failing_detector_does_not_hide_other_findings() {
        let mut failing_clean = DetectorRegistry::new();
        failing_clean
            .register("glasses", StubDetector::failing("onnx"), vec!["Glasses".to_string()], None)
            .unwrap();
        failing_clean
            .register("ppe", StubDetector::with_classes(&[0]), ppe_vocabulary(), None)
            .unwrap();

        let mut store = InMemoryIncidentStore::new();
        let mut consumer = consumer_with(&store, failing_clean, ConsumerSettings::default());
        let first = store.append_capture("2025-03-01", "08:00:00", &jpeg()).unwrap();
        consumer.poll_once().unwrap();
        let record = inspection(&mut store, first);
        assert_eq!(record.status, InspectionStatus::Uninspectable);
        assert!(record.detail.unwrap().contains("glasses"));

        let mut failing_flagged = DetectorRegistry::new();
        failing_flagged
            .register("glasses", StubDetector::failing("onnx"), vec!["Glasses".to_string()], None)
            .unwrap();
        failing_flagged
            .register("ppe", StubDetector::with_classes(&[3]), ppe_vocabulary(), None)
            .unwrap();
        let mut consumer = consumer_with(&store, failing_flagged, ConsumerSettings::default());
        let second = store.append_capture("2025-03-01", "08:01:00", &jpeg()).unwrap();
        consumer.poll_once().unwrap();
        assert_eq!(inspection(&mut store, second).status, InspectionStatus::Flagged);
        assert_eq!(
            store.incidents_after(0, 10).unwrap()[0].labels,
            vec!["ppe:NO-Safety Vest"]
        );
    }

    #[test]
    fn restarted_consumer_does_not_reprocess() {
        let mut store = InMemoryIncidentStore::new();
        let mut consumer = consumer_with(&store, registry(&[1], &[]), ConsumerSettings::default());
        for second in 0..3 {
            store
                .append_capture("2025-03-01", &format!("08:00:0{}", second), &jpeg())
                .unwrap();
        }
        assert_eq!(consumer.poll_once().unwrap().flagged, 3);
        assert_eq!(consumer.last_processed_id(), store.max_capture_id().unwrap());

        let mut restarted = consumer_with(&store, registry(&[1], &[]), ConsumerSettings::default());
        assert_eq!(restarted.last_processed_id(), 3);
        assert_eq!(restarted.poll_once().unwrap().processed, 0);
        assert_eq!(store.incidents_after(0, 10).unwrap().len(), 3);
    }

    #[test]
    fn fresh_consumer_starts_after_existing_captures() {
        let mut store = InMemoryIncidentStore::new();
        store.append_capture("2025-03-01", "07:00:00", &jpeg()).unwrap();
        store.append_capture("2025-03-01", "07:00:30", &jpeg()).unwrap();

        let mut consumer = consumer_with(&store, registry(&[1], &[]), ConsumerSettings::default());
        assert_eq!(consumer.last_processed_id(), 2);
        assert_eq!(consumer.poll_once().unwrap().processed, 0);
    }

    #[test]
    fn backlog_drop_oldest_marks_excess_as_dropped() {
        let mut store = InMemoryIncidentStore::new();
        let settings = ConsumerSettings {
            max_backlog: Some(2),
            backlog_policy: BacklogPolicy::DropOldest,
            ..ConsumerSettings::default()
        };
        let mut consumer = consumer_with(&store, registry(&[0], &[0]), settings);
        let ids: Vec<i64> = (0..5)
            .map(|i| {
                store
                    .append_capture("2025-03-01", &format!("09:00:0{}", i), &jpeg())
                    .unwrap()
            })
            .collect();

        let summary = consumer.poll_once().unwrap();
        assert_eq!(summary.dropped, 3);
        assert_eq!(summary.clean, 2);
        for id in &ids[..3] {
            assert_eq!(inspection(&mut store, *id).status, InspectionStatus::Dropped);
        }
        assert_eq!(inspection(&mut store, ids[4]).status, InspectionStatus::Clean);
    }

    #[test]
    fn backlog_alert_processes_everything() {
        let mut store = InMemoryIncidentStore::new();
        let settings = ConsumerSettings {
            max_backlog: Some(1),
            batch_size: 10,
            ..ConsumerSettings::default()
        };
        let mut consumer = consumer_with(&store, registry(&[0], &[0]), settings);
        for i in 0..3 {
            store
                .append_capture("2025-03-01", &format!("09:00:0{}", i), &jpeg())
                .unwrap();
        }
        let summary = consumer.poll_once().unwrap();
        assert_eq!(summary.clean, 3);
        assert_eq!(summary.dropped, 0);
    }

    /// Delegates to the in-memory store, optionally refusing inspection writes,
    /// and counts the capture images it hands out.
    #[derive(Clone, Default)]
    struct FaultyStore {
        inner: InMemoryIncidentStore,
        reject_incidents: bool,
        reject_commits: bool,
        images_read: Arc<AtomicUsize>,
    }

    impl IncidentStore for FaultyStore {
        fn append_capture(&mut self, date: &str, time: &str, image: &[u8]) -> Result<i64> {
            self.inner.append_capture(date, time, image)
        }
        fn captures_after(&mut self, after_id: i64, limit: usize) -> Result<Vec<CapturedImage>> {
            let captures = self.inner.captures_after(after_id, limit)?;
            self.images_read.fetch_add(captures.len(), Ordering::SeqCst);
            Ok(captures)
        }
        fn capture_ids_after(&mut self, after_id: i64, limit: usize) -> Result<Vec<i64>> {
            self.inner.capture_ids_after(after_id, limit)
        }
        fn count_captures_after(&mut self, after_id: i64) -> Result<u64> {
            self.inner.count_captures_after(after_id)
        }
        fn max_capture_id(&mut self) -> Result<i64> {
            self.inner.max_capture_id()
        }
        fn incidents_after(&mut self, after_id: i64, limit: usize) -> Result<Vec<Incident>> {
            self.inner.incidents_after(after_id, limit)
        }
        fn commit_inspection(&mut self, inspection: &Inspection) -> Result<Option<i64>> {
            if self.reject_commits || (self.reject_incidents && inspection.incident.is_some()) {
                return Err(anyhow!("disk full"));
            }
            self.inner.commit_inspection(inspection)
        }
        fn inspection(&mut self, capture_id: i64) -> Result<Option<InspectionRecord>> {
            self.inner.inspection(capture_id)
        }
        fn load_cursor(&mut self) -> Result<Option<i64>> {
            self.inner.load_cursor()
        }
        fn save_cursor(&mut self, last_id: i64) -> Result<()> {
            self.inner.save_cursor(last_id)
        }
    }

    fn faulty_consumer(
        store: FaultyStore,
        registry: DetectorRegistry,
        settings: ConsumerSettings,
    ) -> DetectionConsumer<FaultyStore> {
        DetectionConsumer::new(
            store,
            registry,
            Box::new(NegativeMarkerPolicy::default()),
            settings,
        )
        .unwrap()
    }

    #[test]
    fn failed_incident_write_is_dropped_and_not_retried() {
        let mut store = InMemoryIncidentStore::new();
        let faulty = FaultyStore {
            inner: store.clone(),
            reject_incidents: true,
            ..FaultyStore::default()
        };
        let mut consumer = faulty_consumer(faulty, registry(&[1], &[]), ConsumerSettings::default());
        let id = store.append_capture("2025-03-01", "10:00:00", &jpeg()).unwrap();

        assert_eq!(consumer.poll_once().unwrap().dropped, 1);
        let record = inspection(&mut store, id);
        assert_eq!(record.status, InspectionStatus::Dropped);
        assert!(record.detail.unwrap().contains("disk full"));
        // Raw capture is kept.
        assert_eq!(store.captures_after(0, 10).unwrap().len(), 1);
        assert_eq!(consumer.poll_once().unwrap().processed, 0);
    }

    #[test]
    fn failed_clean_commit_still_saves_cursor() {
        let mut store = InMemoryIncidentStore::new();
        let faulty = FaultyStore {
            inner: store.clone(),
            reject_commits: true,
            ..FaultyStore::default()
        };
        let mut consumer = faulty_consumer(faulty, registry(&[0], &[0]), ConsumerSettings::default());
        let id = store.append_capture("2025-03-01", "10:00:00", &jpeg()).unwrap();

        assert_eq!(consumer.poll_once().unwrap().clean, 1);
        assert!(store.inspection(id).unwrap().is_none());
        assert_eq!(store.load_cursor().unwrap(), Some(id));

        let mut restarted = consumer_with(&store, registry(&[0], &[0]), ConsumerSettings::default());
        assert_eq!(restarted.last_processed_id(), id);
        assert_eq!(restarted.poll_once().unwrap().processed, 0);
    }

    #[test]
    fn backlog_drop_reads_ids_not_images() {
        let store = FaultyStore::default();
        let images_read = store.images_read.clone();
        let settings = ConsumerSettings {
            batch_size: 2,
            max_backlog: Some(2),
            backlog_policy: BacklogPolicy::DropOldest,
            ..ConsumerSettings::default()
        };
        let mut consumer = faulty_consumer(store.clone(), registry(&[0], &[0]), settings);
        let mut inner = store.inner.clone();
        for i in 0..7 {
            inner
                .append_capture("2025-03-01", &format!("09:00:0{}", i), &jpeg())
                .unwrap();
        }

        let summary = consumer.poll_once().unwrap();
        assert_eq!(summary.dropped, 5);
        assert_eq!(summary.clean, 2);
        assert_eq!(images_read.load(Ordering::SeqCst), 2);
        for id in 1..=5 {
            assert_eq!(inspection(&mut inner, id).status, InspectionStatus::Dropped);
        }
        assert_eq!(inner.load_cursor().unwrap(), Some(7));
    }

    #[test]
    fn run_returns_once_shutdown_is_set() {
        let store = InMemoryIncidentStore::new();
        let mut consumer = consumer_with(&store, registry(&[], &[]), ConsumerSettings::default());
        let shutdown = AtomicBool::new(true);
        consumer.run(&shutdown).unwrap();
    }

    #[test]
    fn backlog_policy_parses_config_values() {
        assert_eq!(BacklogPolicy::parse("alert").unwrap(), BacklogPolicy::Alert);
        assert_eq!(
            BacklogPolicy::parse("DROP_OLDEST").unwrap(),
            BacklogPolicy::DropOldest
        );
        assert!(BacklogPolicy::parse("ignore").is_err());
    }
}
