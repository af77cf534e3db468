//! Dahua CGI camera client.
//!
//! - Alarm stream: `GET /cgi-bin/eventManager.cgi?action=attach&codes=[...]`
//! - Snapshot: `GET /cgi-bin/snapshot.cgi[?channel=N]`
//!
//! Both endpoints require digest auth. The first request on a fresh client is
//! answered with a 401 challenge; later requests reuse the cached nonce until the
//! camera rejects it.

use std::io::{BufRead, BufReader, Read};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use url::{Position, Url};

use super::digest::{DigestChallenge, DigestSession};
use super::{Camera, Credentials};

const EVENT_PATH: &str = "cgi-bin/eventManager.cgi";
const SNAPSHOT_PATH: &str = "cgi-bin/snapshot.cgi";
const MAX_SNAPSHOT_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct DahuaSettings {
    /// `http(s)://host[:port]/`
    pub base_url: String,
    pub credentials: Credentials,
    pub channel: Option<u32>,
    /// Ask the camera for heartbeat lines at this interval. Reads that stay silent
    /// for three intervals fail, so a dead connection is noticed.
    pub heartbeat: Option<Duration>,
    pub request_timeout: Duration,
}

pub struct DahuaCamera {
    base_url: Url,
    credentials: Credentials,
    channel: Option<u32>,
    heartbeat: Option<Duration>,
    agent: ureq::Agent,
    stream_agent: ureq::Agent,
    session: Mutex<Option<DigestSession>>,
}

impl DahuaCamera {
    pub fn new(settings: DahuaSettings) -> Result<Self> {
        let mut base_url = Url::parse(&settings.base_url)
            .with_context(|| format!("parse camera url {}", settings.base_url))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported camera scheme '{}'; expected http or https",
                base_url.scheme()
            ));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(settings.request_timeout)
            .timeout(settings.request_timeout)
            .build();
        let mut stream_builder = ureq::AgentBuilder::new().timeout_connect(settings.request_timeout);
        if let Some(heartbeat) = settings.heartbeat {
            stream_builder = stream_builder.timeout_read(heartbeat * 3);
        }

        Ok(Self {
            base_url,
            credentials: settings.credentials,
            channel: settings.channel,
            heartbeat: settings.heartbeat,
            agent,
            stream_agent: stream_builder.build(),
            session: Mutex::new(None),
        })
    }

    pub fn event_url(&self, codes: &[&str]) -> Result<Url> {
        if codes.is_empty() {
            return Err(anyhow!("at least one event code is required"));
        }
        let mut url = self.base_url.join(EVENT_PATH)?;
        let mut query = format!("action=attach&codes=[{}]", codes.join(","));
        if let Some(heartbeat) = self.heartbeat {
            query.push_str(&format!("&heartbeat={}", heartbeat.as_secs().max(1)));
        }
        url.set_query(Some(&query));
        Ok(url)
    }

    pub fn snapshot_url(&self) -> Result<Url> {
        let mut url = self.base_url.join(SNAPSHOT_PATH)?;
        if let Some(channel) = self.channel {
            url.set_query(Some(&format!("channel={}", channel)));
        }
        Ok(url)
    }

    fn cached_authorization(&self, uri: &str) -> Result<Option<String>> {
        let mut guard = self
            .session
            .lock()
            .map_err(|_| anyhow!("digest session lock poisoned"))?;
        Ok(guard
            .as_mut()
            .map(|session| session.authorize(&self.credentials, "GET", uri)))
    }

    fn get(&self, agent: &ureq::Agent, url: &Url) -> Result<ureq::Response> {
        let uri = &url[Position::BeforePath..];
        let request = agent.get(url.as_str());
        let first = match self.cached_authorization(uri)? {
            Some(authorization) => request.set("Authorization", &authorization).call(),
            None => request.call(),
        };

        let challenge = match first {
            Ok(response) => return Ok(response),
            Err(ureq::Error::Status(401, response)) => {
                let header = response
                    .all("WWW-Authenticate")
                    .into_iter()
                    .find(|h| h.trim_start().to_ascii_lowercase().starts_with("digest"))
                    .ok_or_else(|| anyhow!("camera answered 401 for {} without a digest challenge", uri))?;
                DigestChallenge::parse(header)?
            }
            Err(err) => return Err(describe_error(err, uri)),
        };

        let authorization = {
            let mut guard = self
                .session
                .lock()
                .map_err(|_| anyhow!("digest session lock poisoned"))?;
            guard
                .insert(DigestSession::new(challenge))
                .authorize(&self.credentials, "GET", uri)
        };
        agent
            .get(url.as_str())
            .set("Authorization", &authorization)
            .call()
            .map_err(|err| describe_error(err, uri))
    }
}

fn describe_error(err: ureq::Error, uri: &str) -> anyhow::Error {
    match err {
        ureq::Error::Status(code, response) => anyhow!(
            "camera returned HTTP {} {} for {}",
            code,
            response.status_text(),
            uri
        ),
        ureq::Error::Transport(transport) => {
            anyhow!("camera request {} failed: {}", uri, transport)
        }
    }
}

impl Camera for DahuaCamera {
    fn open_event_stream(&self, codes: &[&str]) -> Result<Box<dyn BufRead + Send>> {
        let url = self.event_url(codes)?;
        let response = self.get(&self.stream_agent, &url)?;
        if response.status() != 200 {
            return Err(anyhow!(
                "event stream rejected: HTTP {} {}",
                response.status(),
                response.status_text()
            ));
        }
        Ok(Box::new(BufReader::new(response.into_reader())))
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        let url = self.snapshot_url()?;
        let response = self.get(&self.agent, &url)?;
        if response.status() != 200 {
            return Err(anyhow!(
                "snapshot rejected: HTTP {} {}",
                response.status(),
                response.status_text()
            ));
        }
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_SNAPSHOT_BYTES + 1)
            .read_to_end(&mut bytes)
            .context("read snapshot body")?;
        if bytes.is_empty() {
            return Err(anyhow!("camera returned an empty snapshot"));
        }
        if bytes.len() as u64 > MAX_SNAPSHOT_BYTES {
            return Err(anyhow!(
                "snapshot exceeds {} bytes",
                MAX_SNAPSHOT_BYTES
            ));
        }
        Ok(bytes)
    }
}
