//! HTTP digest access authentication (RFC 7616), client side.
//!
//! Supports MD5 and SHA-256, with `qop=auth` or the legacy no-qop form. The
//! session caches the server nonce so subsequent requests skip the 401 round trip.

use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use md5::Md5;
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::Credentials;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "MD5" => Ok(DigestAlgorithm::Md5),
            "SHA-256" => Ok(DigestAlgorithm::Sha256),
            other => Err(anyhow!("unsupported digest algorithm '{}'", other)),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
        }
    }

    fn hash(&self, input: &str) -> String {
        match self {
            DigestAlgorithm::Md5 => hex_digest::<Md5>(input),
            DigestAlgorithm::Sha256 => hex_digest::<Sha256>(input),
        }
    }
}

fn hex_digest<D: Digest>(input: &str) -> String {
    hex::encode(D::digest(input.as_bytes()))
}

/// Parameters from a `WWW-Authenticate: Digest ...` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// True when the server offers `qop=auth`.
    pub qop_auth: bool,
    pub algorithm: DigestAlgorithm,
}

fn param_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z-]+)\s*=\s*(?:"([^"]*)"|([^\s,]+))"#).expect("digest param regex")
    })
}

impl DigestChallenge {
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let params = match header.split_once(char::is_whitespace) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("digest") => rest,
            _ => {
                return Err(anyhow!(
                    "camera requested unsupported auth scheme: {}",
                    header.split_whitespace().next().unwrap_or("<empty>")
                ))
            }
        };

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop_auth = false;
        let mut algorithm = DigestAlgorithm::Md5;
        for caps in param_regex().captures_iter(params) {
            let key = caps[1].to_ascii_lowercase();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            match key.as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => {
                    qop_auth = value
                        .split(',')
                        .any(|q| q.trim().eq_ignore_ascii_case("auth"))
                }
                "algorithm" => algorithm = DigestAlgorithm::parse(&value)?,
                _ => {}
            }
        }

        Ok(Self {
            realm: realm.ok_or_else(|| anyhow!("digest challenge missing realm"))?,
            nonce: nonce.ok_or_else(|| anyhow!("digest challenge missing nonce"))?,
            opaque,
            qop_auth,
            algorithm,
        })
    }
}

/// A challenge plus the nonce count used against it.
#[derive(Clone, Debug)]
pub struct DigestSession {
    challenge: DigestChallenge,
    nonce_count: u32,
}

impl DigestSession {
    pub fn new(challenge: DigestChallenge) -> Self {
        Self {
            challenge,
            nonce_count: 0,
        }
    }

    pub fn challenge(&self) -> &DigestChallenge {
        &self.challenge
    }

    /// `Authorization` header value for the next request.
    pub fn authorize(&mut self, credentials: &Credentials, method: &str, uri: &str) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let cnonce = hex::encode(bytes);
        self.authorize_with_cnonce(credentials, method, uri, &cnonce)
    }

    pub fn authorize_with_cnonce(
        &mut self,
        credentials: &Credentials,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> String {
        self.nonce_count = self.nonce_count.wrapping_add(1);
        let c = &self.challenge;
        let alg = c.algorithm;
        let ha1 = alg.hash(&format!(
            "{}:{}:{}",
            credentials.username(),
            c.realm,
            credentials.password()
        ));
        let ha2 = alg.hash(&format!("{}:{}", method, uri));
        let nc = format!("{:08x}", self.nonce_count);

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}",
            credentials.username(),
            c.realm,
            c.nonce,
            uri,
            alg.as_str()
        );
        let response = if c.qop_auth {
            alg.hash(&format!("{}:{}:{}:{}:auth:{}", ha1, c.nonce, nc, cnonce, ha2))
        } else {
            alg.hash(&format!("{}:{}:{}", ha1, c.nonce, ha2))
        };
        header.push_str(&format!(", response=\"{}\"", response));
        if c.qop_auth {
            header.push_str(&format!(", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce));
        }
        if let Some(opaque) = &c.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        header
    }
}
