//! Engine and worker configuration.
//!
//! Both structs have sensible defaults and can be loaded from a JSON file:
//!
//! ```no_run
//! use sketchflow::config::WorkerConfig;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = WorkerConfig::from_json_file("worker.json")?;
//! println!("listening on {}", config.listen_address);
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

/// Default port a worker listens on.
pub const DEFAULT_PORT: u16 = 3569;

/// Tuning knobs shared by every dataset in a process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Composite datasets coalesce results arriving within this window.
    /// Zero disables bundling.
    #[serde(with = "millis")]
    pub bundle_interval: Duration,
    /// Upper bound on one remote call, from request to last response.
    #[serde(with = "millis")]
    pub rpc_timeout: Duration,
    /// Compute pool size; `None` means one thread per CPU.
    pub compute_threads: Option<usize>,
    /// Largest wire frame accepted in either direction.
    pub max_frame_length: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bundle_interval: Duration::from_millis(250),
            rpc_timeout: Duration::from_secs(10 * 60),
            compute_threads: None,
            max_frame_length: 20 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rpc_timeout.is_zero() {
            return Err(Error::Config("rpc_timeout must be positive".into()));
        }
        if self.max_frame_length == 0 {
            return Err(Error::Config("max_frame_length must be positive".into()));
        }
        if self.compute_threads == Some(0) {
            return Err(Error::Config("compute_threads must be positive".into()));
        }
        Ok(())
    }
}

/// Configuration of a worker process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Address the worker listens on.
    pub listen_address: String,
    /// Replay results of repeated commands.
    pub memoize: bool,
    pub engine: EngineConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_address: format!("127.0.0.1:{DEFAULT_PORT}"),
            memoize: true,
            engine: EngineConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.listen_address.trim().is_empty() {
            return Err(Error::Config("listen_address must not be empty".into()));
        }
        self.engine.validate()
    }

    /// Read and validate a JSON configuration file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::Config(format!("cannot open {}: {e}", path.display())))?;
        let config: WorkerConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let c = WorkerConfig::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.engine.bundle_interval, Duration::from_millis(250));
        assert_eq!(c.engine.rpc_timeout, Duration::from_secs(600));
    }

    #[test]
    fn partial_json_fills_defaults() -> anyhow::Result<()> {
        let mut f = tempfile::NamedTempFile::new()?;
        write!(
            f,
            r#"{{ "listen_address": "0.0.0.0:4000", "engine": {{ "bundle_interval": 0 }} }}"#
        )?;
        let c = WorkerConfig::from_json_file(f.path())?;
        assert_eq!(c.listen_address, "0.0.0.0:4000");
        assert!(c.memoize);
        assert!(c.engine.bundle_interval.is_zero());
        assert_eq!(c.engine.max_frame_length, 20 * 1024 * 1024);
        Ok(())
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let c = EngineConfig {
            rpc_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(Error::Config(_))));
    }
}
