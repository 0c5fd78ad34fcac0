//! Process-wide configuration
//!
//! Configuration is read from environment variables exactly once, on first
//! use. Unknown variables are ignored; malformed values are fatal, since a
//! half-configured substrate would silently hand out wrong deadlines.

use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default deadline applied when neither a timeout nor a parent is supplied.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8 * 60 * 60);

/// Default deadline as monotonic nanos offset.
pub const DEFAULT_TIMEOUT_NANOS: i64 = DEFAULT_TIMEOUT.as_nanos() as i64;

const ENV_DEFAULT_TIMEOUT_NANOS: &str = "BROKKR_DEFAULT_TIMEOUT_NANOS";
const ENV_CONTEXT_FACTORY: &str = "BROKKR_CONTEXT_FACTORY";
const ENV_CONTEXT_FACTORY_WRAPPER: &str = "BROKKR_CONTEXT_FACTORY_WRAPPER";
const ENV_CONTEXT_ATTACHER: &str = "BROKKR_CONTEXT_ATTACHER";

/// Registry name of an execution-context factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FactoryKind {
    /// Plain context construction, no side effects
    #[default]
    Basic,
}

impl FromStr for FactoryKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "basic" => Ok(Self::Basic),
            other => Err(Error::unknown_factory(other)),
        }
    }
}

/// Registry name of a factory decorator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryWrapperKind {
    /// Emits a tracing event and counts every context started
    Logging,
}

impl FromStr for FactoryWrapperKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "logging" => Ok(Self::Logging),
            other => Err(Error::unknown_factory_wrapper(other)),
        }
    }
}

/// Registry name of a per-thread context attacher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttacherKind {
    /// Per-thread context stack only
    #[default]
    ThreadStack,
    /// Context stack plus a thread-local operation-id slot for diagnostics
    Diagnostic,
}

impl FromStr for AttacherKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "thread-stack" => Ok(Self::ThreadStack),
            "diagnostic" => Ok(Self::Diagnostic),
            other => Err(Error::unknown_attacher(other)),
        }
    }
}

/// Resolved substrate configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Deadline offset applied when none is supplied
    pub default_timeout_nanos: i64,

    /// Which context factory to install
    pub factory: FactoryKind,

    /// Optional decorator around the factory
    pub factory_wrapper: Option<FactoryWrapperKind>,

    /// Which attacher maintains the per-thread stack
    pub attacher: AttacherKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout_nanos: DEFAULT_TIMEOUT_NANOS,
            factory: FactoryKind::default(),
            factory_wrapper: None,
            attacher: AttacherKind::default(),
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    ///
    /// Registry names are validated here so later resolution is infallible.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_DEFAULT_TIMEOUT_NANOS) {
            let nanos: i64 = raw
                .parse()
                .map_err(|_| Error::config_var(ENV_DEFAULT_TIMEOUT_NANOS, format!("not a nanosecond count: {raw:?}")))?;
            if nanos <= 0 {
                return Err(Error::config_var(
                    ENV_DEFAULT_TIMEOUT_NANOS,
                    "timeout must be positive",
                ));
            }
            config.default_timeout_nanos = nanos;
        }
        if let Some(raw) = lookup(ENV_CONTEXT_FACTORY) {
            config.factory = raw.parse()?;
        }
        if let Some(raw) = lookup(ENV_CONTEXT_FACTORY_WRAPPER) {
            config.factory_wrapper = Some(raw.parse()?);
        }
        if let Some(raw) = lookup(ENV_CONTEXT_ATTACHER) {
            config.attacher = raw.parse()?;
        }
        Ok(config)
    }

    /// The default timeout as a [`Duration`].
    pub fn default_timeout(&self) -> Duration {
        Duration::from_nanos(self.default_timeout_nanos.max(0) as u64)
    }
}

/// The process-wide configuration, read on first access.
///
/// A malformed environment is fatal here; embedders that prefer a
/// recoverable path should call [`Config::from_env`] during their own
/// startup before anything touches the substrate.
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match Config::from_env() {
        Ok(config) => config,
        Err(e) => panic!("brokkr configuration is invalid: {e}"),
    })
}
