//! Management datagram (MAD) client engine for InfiniBand/Omni-Path fabrics
//!
//! This crate talks to the fabric's subnet administration (SA) and
//! performance administration (PA) services, either natively through a local
//! management interface or out-of-band over TCP (optionally TLS) through a
//! remote management node.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │ sa.rs / pa.rs        │  typed queries, status mapping
//! ├──────────────────────┤
//! │ session.rs           │  tid, timeout/retry, address cache
//! ├──────────┬───────────┤
//! │ native.rs│  oob.rs   │  Transport implementations
//! ├──────────┤           │
//! │ umad.rs  │  TCP/TLS  │
//! └──────────┴───────────┘
//!        monitor.rs: background thread refreshing the cache (native only)
//! ```
//!
//! # Features
//!
//! - `real-umad`: `libibumad` is loaded at runtime. Without it an in-process
//!   mock fabric backs native sessions.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod error;
pub mod mad;
pub mod mock;
pub mod monitor;
pub mod native;
pub mod oob;
pub mod pa;
pub mod rmpp;
pub mod sa;
pub mod session;
pub mod transport;
pub mod umad;

pub use error::{MadError, MadResult};
pub use monitor::PortEvent;
pub use session::{RefreshMode, ServiceState, Session};
pub use transport::{Destination, Transport, TransportKind};

/// TLS settings for out-of-band sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM bundle of trusted CA certificates; required
    pub ca_file: Option<PathBuf>,
    /// PEM client certificate chain, together with `key_file`
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Name checked against the server certificate; defaults to the host
    pub server_name: Option<String>,
}

/// Which wire a session opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionMode {
    /// Local port, by device name or by 1-based device index (0 = first).
    /// Port 0 selects the first active port.
    Native {
        #[serde(default)]
        device: Option<String>,
        #[serde(default)]
        hfi: u32,
        #[serde(default)]
        port: u8,
    },
    /// Remote management node
    Oob { host: String, port: u16 },
}

/// Configuration for a MAD engine session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MadEngineConfig {
    pub mode: SessionMode,
    /// Per-attempt timeout in milliseconds
    pub timeout_ms: u64,
    /// Resends after a timeout
    pub retry_count: u32,
    /// Housekeeping interval of the event monitor
    pub monitor_interval_ms: u64,
    pub tls: Option<TlsConfig>,
}

impl Default for MadEngineConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::Native {
                device: None,
                hfi: 0,
                port: 0,
            },
            timeout_ms: session::DEFAULT_TIMEOUT_MS,
            retry_count: session::DEFAULT_RETRY_COUNT,
            monitor_interval_ms: monitor::DEFAULT_MONITOR_INTERVAL_MS,
            tls: None,
        }
    }
}

impl MadEngineConfig {
    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> MadResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| MadError::invalid_parameter(format!("{}: {}", path.display(), e)))
    }
}
