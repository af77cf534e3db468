//! Camera collaborators.
//!
//! The pipeline needs two things from a camera: a long-lived alarm stream and a
//! still image on request. `Camera` is the seam; `DahuaCamera` speaks the Dahua
//! CGI API over HTTP digest auth.

use std::fmt;
use std::io::BufRead;

use anyhow::Result;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub mod dahua;
pub mod digest;

pub use dahua::{DahuaCamera, DahuaSettings};

pub trait Camera: Send + Sync {
    /// Open the alarm stream filtered to `codes`. The reader yields newline
    /// delimited text until the connection ends.
    fn open_event_stream(&self, codes: &[&str]) -> Result<Box<dyn BufRead + Send>>;

    /// Fetch one still image. Any non-success response is an error.
    fn snapshot(&self) -> Result<Vec<u8>>;
}

/// Camera login. The password is wiped from memory on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
