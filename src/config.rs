use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroize;

use crate::alarm::DEFAULT_ALARM_CODE;
use crate::camera::{Credentials, DahuaSettings};
use crate::capture::DEFAULT_COOLDOWN;
use crate::consumer::{BacklogPolicy, ConsumerSettings};
use crate::policy::{AggregationPolicy, NegativeMarkerPolicy, QuorumPolicy, DEFAULT_NEGATIVE_MARKER};
use crate::supervisor::Backoff;

const DEFAULT_DB_PATH: &str = "tripwire.db";
const DEFAULT_CAMERA_HOST: &str = "192.168.1.108";
const DEFAULT_CAMERA_PORT: u16 = 80;
const DEFAULT_CAMERA_SCHEME: &str = "http";
const DEFAULT_HEARTBEAT_SECS: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_INITIAL_BACKOFF_SECS: u64 = 1;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 60;

#[derive(Debug, Deserialize, Default)]
struct TripwireConfigFile {
    db_path: Option<String>,
    cooldown_secs: Option<u64>,
    camera: Option<CameraConfigFile>,
    consumer: Option<ConsumerConfigFile>,
    policy: Option<PolicyConfigFile>,
    supervisor: Option<SupervisorConfigFile>,
    detectors: Option<Vec<DetectorConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    host: Option<String>,
    port: Option<u16>,
    scheme: Option<String>,
    username: Option<String>,
    password: Option<String>,
    channel: Option<u32>,
    alarm_code: Option<String>,
    heartbeat_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ConsumerConfigFile {
    poll_interval_secs: Option<u64>,
    batch_size: Option<usize>,
    max_backlog: Option<u64>,
    backlog_policy: Option<String>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct PolicyConfigFile {
    kind: Option<String>,
    negative_marker: Option<String>,
    min_detectors: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct SupervisorConfigFile {
    initial_backoff_secs: Option<u64>,
    max_backoff_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DetectorConfigFile {
    name: String,
    model_path: PathBuf,
    labels: Vec<String>,
    allow: Option<Vec<String>>,
    input_size: Option<u32>,
    confidence: Option<f32>,
    iou: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct TripwireConfig {
    pub db_path: String,
    pub cooldown: Duration,
    pub camera: CameraSettings,
    pub consumer: ConsumerSettings,
    pub policy: PolicySettings,
    pub supervisor: SupervisorSettings,
    pub detectors: Vec<DetectorSettings>,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub credentials: Credentials,
    pub channel: Option<u32>,
    pub alarm_code: String,
    pub heartbeat: Option<Duration>,
    pub request_timeout: Duration,
}

impl CameraSettings {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}/", self.scheme, self.host, self.port)
    }

    pub fn dahua(&self) -> DahuaSettings {
        DahuaSettings {
            base_url: self.base_url(),
            credentials: self.credentials.clone(),
            channel: self.channel,
            heartbeat: self.heartbeat,
            request_timeout: self.request_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyKind {
    AnyNegative,
    Quorum { min_detectors: usize },
}

#[derive(Debug, Clone)]
pub struct PolicySettings {
    pub kind: PolicyKind,
    pub negative_marker: String,
}

impl PolicySettings {
    pub fn build(&self) -> Result<Box<dyn AggregationPolicy>> {
        let markers = NegativeMarkerPolicy::new(&self.negative_marker)?;
        Ok(match self.kind {
            PolicyKind::AnyNegative => Box::new(markers),
            PolicyKind::Quorum { min_detectors } => {
                Box::new(QuorumPolicy::new(markers, min_detectors)?)
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl SupervisorSettings {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff, self.max_backoff)
    }
}

/// One detection model and its label vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub name: String,
    pub model_path: PathBuf,
    pub labels: Vec<String>,
    pub allow: Option<Vec<String>>,
    pub input_size: u32,
    pub confidence: f32,
    pub iou: f32,
}

impl DetectorSettings {
    fn with_defaults(name: &str, labels: &[&str], allow: Option<&[&str]>) -> Self {
        Self {
            name: name.to_string(),
            model_path: PathBuf::from(format!("models/{}.onnx", name)),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            allow: allow.map(|allow| allow.iter().map(|l| l.to_string()).collect()),
            input_size: DEFAULT_INPUT_SIZE,
            confidence: DEFAULT_CONFIDENCE,
            iou: DEFAULT_IOU,
        }
    }
}

/// Gloves, glasses and the general PPE model, with PPE limited to the labels that
/// matter for an equipment check.
pub fn default_detectors() -> Vec<DetectorSettings> {
    vec![
        DetectorSettings::with_defaults("gloves", &["Gloves", "No-Gloves"], None),
        DetectorSettings::with_defaults("glasses", &["Glasses", "No-Glasses"], None),
        DetectorSettings::with_defaults(
            "ppe",
            &[
                "Hardhat",
                "Mask",
                "NO-Hardhat",
                "NO-Mask",
                "NO-Safety Vest",
                "Person",
                "Safety Cone",
                "Safety Vest",
                "machinery",
                "vehicle",
            ],
            Some(&[
                "Safety Vest",
                "NO-Safety Vest",
                "Hardhat",
                "NO-Hardhat",
                "NO-Mask",
                "Mask",
            ]),
        ),
    ]
}

impl TripwireConfig {
    /// Defaults, then the file named by `TRIPWIRE_CONFIG`, then environment
    /// overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TRIPWIRE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(mut file: TripwireConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let cooldown = file
            .cooldown_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_COOLDOWN);

        let mut camera_file = file.camera.take().unwrap_or_default();
        let credentials = Credentials::new(
            camera_file.username.as_deref().unwrap_or_default(),
            camera_file.password.as_deref().unwrap_or_default(),
        );
        camera_file.password.zeroize();
        let heartbeat_secs = camera_file.heartbeat_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS);
        let camera = CameraSettings {
            host: camera_file
                .host
                .unwrap_or_else(|| DEFAULT_CAMERA_HOST.to_string()),
            port: camera_file.port.unwrap_or(DEFAULT_CAMERA_PORT),
            scheme: camera_file
                .scheme
                .unwrap_or_else(|| DEFAULT_CAMERA_SCHEME.to_string()),
            credentials,
            channel: camera_file.channel,
            alarm_code: camera_file
                .alarm_code
                .unwrap_or_else(|| DEFAULT_ALARM_CODE.to_string()),
            // 0 disables heartbeats.
            heartbeat: (heartbeat_secs > 0).then(|| Duration::from_secs(heartbeat_secs)),
            request_timeout: Duration::from_secs(
                camera_file
                    .request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
        };

        let defaults = ConsumerSettings::default();
        let consumer_file = file.consumer.unwrap_or_default();
        let consumer = ConsumerSettings {
            poll_interval: consumer_file
                .poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            batch_size: consumer_file.batch_size.unwrap_or(defaults.batch_size),
            max_backlog: consumer_file.max_backlog,
            backlog_policy: match consumer_file.backlog_policy.as_deref() {
                Some(policy) => BacklogPolicy::parse(policy)?,
                None => defaults.backlog_policy,
            },
            jpeg_quality: consumer_file.jpeg_quality.unwrap_or(defaults.jpeg_quality),
            box_thickness: defaults.box_thickness,
        };

        let policy_file = file.policy.unwrap_or_default();
        let kind = match policy_file.kind.as_deref().unwrap_or("any_negative") {
            "any_negative" => PolicyKind::AnyNegative,
            "quorum" => PolicyKind::Quorum {
                min_detectors: policy_file.min_detectors.unwrap_or(2),
            },
            other => {
                return Err(anyhow!(
                    "unknown policy kind '{}'; expected any_negative or quorum",
                    other
                ))
            }
        };
        let policy = PolicySettings {
            kind,
            negative_marker: policy_file
                .negative_marker
                .unwrap_or_else(|| DEFAULT_NEGATIVE_MARKER.to_string()),
        };

        let supervisor_file = file.supervisor.unwrap_or_default();
        let supervisor = SupervisorSettings {
            initial_backoff: Duration::from_secs(
                supervisor_file
                    .initial_backoff_secs
                    .unwrap_or(DEFAULT_INITIAL_BACKOFF_SECS),
            ),
            max_backoff: Duration::from_secs(
                supervisor_file
                    .max_backoff_secs
                    .unwrap_or(DEFAULT_MAX_BACKOFF_SECS),
            ),
        };

        let detectors = match file.detectors {
            Some(detectors) => detectors
                .into_iter()
                .map(|d| DetectorSettings {
                    name: d.name,
                    model_path: d.model_path,
                    labels: d.labels,
                    allow: d.allow,
                    input_size: d.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
                    confidence: d.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                    iou: d.iou.unwrap_or(DEFAULT_IOU),
                })
                .collect(),
            None => default_detectors(),
        };

        Ok(Self {
            db_path,
            cooldown,
            camera,
            consumer,
            policy,
            supervisor,
            detectors,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("TRIPWIRE_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(host) = std::env::var("TRIPWIRE_CAMERA_HOST") {
            if !host.trim().is_empty() {
                self.camera.host = host.trim().to_string();
            }
        }
        if let Ok(user) = std::env::var("TRIPWIRE_CAMERA_USER") {
            if !user.trim().is_empty() {
                self.camera.credentials =
                    Credentials::new(user.trim(), self.camera.credentials.password());
            }
        }
        if let Ok(mut password) = std::env::var("TRIPWIRE_CAMERA_PASSWORD") {
            if !password.is_empty() {
                self.camera.credentials =
                    Credentials::new(self.camera.credentials.username(), &password);
            }
            password.zeroize();
        }
        if let Some(seconds) = env_secs("TRIPWIRE_COOLDOWN_SECS")? {
            self.cooldown = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_secs("TRIPWIRE_POLL_INTERVAL_SECS")? {
            self.consumer.poll_interval = Duration::from_secs(seconds);
        }
        if let Ok(backlog) = std::env::var("TRIPWIRE_MAX_BACKLOG") {
            let backlog: u64 = backlog
                .trim()
                .parse()
                .map_err(|_| anyhow!("TRIPWIRE_MAX_BACKLOG must be a non-negative integer"))?;
            self.consumer.max_backlog = Some(backlog);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.camera.host.trim().is_empty() {
            return Err(anyhow!("camera host must not be empty"));
        }
        self.camera.scheme = self.camera.scheme.to_ascii_lowercase();
        if !matches!(self.camera.scheme.as_str(), "http" | "https") {
            return Err(anyhow!(
                "camera scheme must be http or https, got '{}'",
                self.camera.scheme
            ));
        }
        if self.camera.credentials.username().is_empty()
            || self.camera.credentials.password().is_empty()
        {
            return Err(anyhow!(
                "camera username and password are required (TRIPWIRE_CAMERA_USER / TRIPWIRE_CAMERA_PASSWORD)"
            ));
        }
        if self.camera.alarm_code.trim().is_empty() {
            return Err(anyhow!("alarm code must not be empty"));
        }
        if self.consumer.poll_interval.is_zero() {
            return Err(anyhow!("poll interval must be greater than zero"));
        }
        if self.consumer.batch_size == 0 {
            return Err(anyhow!("consumer batch size must be at least 1"));
        }
        if !(1..=100).contains(&self.consumer.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be between 1 and 100"));
        }
        if self.supervisor.initial_backoff > self.supervisor.max_backoff {
            return Err(anyhow!("initial backoff must not exceed max backoff"));
        }
        // Rejects an empty marker or a zero quorum.
        self.policy.build()?;

        let mut seen = Vec::new();
        for detector in &self.detectors {
            if detector.name.trim().is_empty() {
                return Err(anyhow!("detector name must not be empty"));
            }
            if seen.contains(&detector.name) {
                return Err(anyhow!("duplicate detector '{}'", detector.name));
            }
            if detector.labels.is_empty() {
                return Err(anyhow!("detector '{}' has no labels", detector.name));
            }
            if !(0.0..=1.0).contains(&detector.confidence) || !(0.0..=1.0).contains(&detector.iou)
            {
                return Err(anyhow!(
                    "detector '{}': confidence and iou must be within 0..=1",
                    detector.name
                ));
            }
            if detector.input_size == 0 || detector.input_size % 32 != 0 {
                return Err(anyhow!(
                    "detector '{}': input size must be a positive multiple of 32",
                    detector.name
                ));
            }
            seen.push(detector.name.clone());
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<TripwireConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_secs(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(value) => {
            let seconds: u64 = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("{} must be an integer number of seconds", key))?;
            Ok(Some(seconds))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_stock_deployment() {
        let cfg = TripwireConfig::from_file(TripwireConfigFile::default()).unwrap();
        assert_eq!(cfg.db_path, "tripwire.db");
        assert_eq!(cfg.cooldown, Duration::from_secs(20));
        assert_eq!(cfg.consumer.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.camera.alarm_code, "CrossLineDetection");
        assert_eq!(cfg.camera.base_url(), "http://192.168.1.108:80/");
        assert_eq!(cfg.policy.kind, PolicyKind::AnyNegative);

        let names: Vec<&str> = cfg.detectors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["gloves", "glasses", "ppe"]);
        let ppe = &cfg.detectors[2];
        assert_eq!(ppe.labels.len(), 10);
        assert_eq!(ppe.allow.as_ref().map(Vec::len), Some(6));
        assert!(cfg.detectors[0].allow.is_none());
    }

    #[test]
    fn parses_toml_sections() {
        let file: TripwireConfigFile = toml::from_str(
            r#"
            db_path = "/var/lib/tripwire/incidents.db"
            cooldown_secs = 30

            [camera]
            host = "10.0.0.5"
            port = 8080
            username = "operator"
            password = "s3cret"
            channel = 2
            heartbeat_secs = 0

            [consumer]
            max_backlog = 100
            backlog_policy = "drop_oldest"

            [policy]
            kind = "quorum"
            min_detectors = 2

            [[detectors]]
            name = "helmet"
            model_path = "models/helmet.onnx"
            labels = ["Helmet", "NO-Helmet"]
            confidence = 0.4
            "#,
        )
        .unwrap();
        let mut cfg = TripwireConfig::from_file(file).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.cooldown, Duration::from_secs(30));
        assert_eq!(cfg.camera.base_url(), "http://10.0.0.5:8080/");
        assert_eq!(cfg.camera.credentials.username(), "operator");
        assert_eq!(cfg.camera.channel, Some(2));
        assert!(cfg.camera.heartbeat.is_none());
        assert_eq!(cfg.consumer.max_backlog, Some(100));
        assert_eq!(cfg.consumer.backlog_policy, BacklogPolicy::DropOldest);
        assert_eq!(cfg.policy.kind, PolicyKind::Quorum { min_detectors: 2 });
        assert_eq!(cfg.policy.build().unwrap().name(), "quorum");
        assert_eq!(cfg.detectors.len(), 1);
        assert_eq!(cfg.detectors[0].input_size, 640);
        assert_eq!(cfg.detectors[0].confidence, 0.4);
    }

    #[test]
    fn validation_requires_credentials() {
        let mut cfg = TripwireConfig::from_file(TripwireConfigFile::default()).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("username and password"));

        cfg.camera.credentials = Credentials::new("admin", "pw");
        cfg.validate().unwrap();

        cfg.detectors.push(cfg.detectors[0].clone());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_policy_kind() {
        let file: TripwireConfigFile = toml::from_str("[policy]\nkind = \"majority\"\n").unwrap();
        assert!(TripwireConfig::from_file(file).is_err());
    }
}
