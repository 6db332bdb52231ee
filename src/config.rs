//! Configuration for engine loading and scanning.
//!
//! [`ScanConfig`] controls a single scan: the native scan flags, the timeout
//! passed through to the engine, and the two early-abort channels handled by
//! the callback bridge (first match only and cooperative cancellation).
//! [`EngineConfig`] names the native library to load and carries the default
//! scan configuration. Both load from YAML or JSON.

use crate::error::{BridgeError, Result};
use crate::ffi;
use serde::{Deserialize, Serialize};
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative cancellation flag shared between a caller and running scans.
///
/// The flag is checked by the callback bridge each time the engine reports an
/// event, so cancellation takes effect between matches, never inside one.
///
/// # Examples
///
/// ```rust
/// use rulebridge::CancellationToken;
///
/// let token = CancellationToken::new();
/// let observer = token.clone();
/// token.cancel();
/// assert!(observer.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl PartialEq for CancellationToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Per-scan options.
///
/// # Examples
///
/// ```rust
/// use rulebridge::ScanConfig;
/// use std::time::Duration;
///
/// let config = ScanConfig::default()
///     .with_fast_mode(true)
///     .with_timeout(Duration::from_millis(1500));
/// assert_eq!(config.native_timeout(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Report only the first occurrence of each pattern.
    pub fast_mode: bool,

    /// Also report rules whose condition evaluated false.
    pub report_non_matching: bool,

    /// Force evaluation of auxiliary modules even when no rule needs them.
    pub process_all_modules: bool,

    /// Ceiling handed to the engine's own timeout. Whole seconds on the wire;
    /// sub-second values round up.
    #[serde(with = "timeout_secs")]
    pub timeout: Option<Duration>,

    /// Abort the scan once the first matching rule has been reported in full.
    pub first_match_only: bool,

    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

impl ScanConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fast mode with early termination, for yes/no decisions.
    pub fn fast() -> Self {
        Self {
            fast_mode: true,
            first_match_only: true,
            ..Default::default()
        }
    }

    /// Every rule reported, matching or not, with all modules evaluated.
    pub fn exhaustive() -> Self {
        Self {
            report_non_matching: true,
            process_all_modules: true,
            ..Default::default()
        }
    }

    pub fn with_fast_mode(mut self, enable: bool) -> Self {
        self.fast_mode = enable;
        self
    }

    pub fn with_report_non_matching(mut self, enable: bool) -> Self {
        self.report_non_matching = enable;
        self
    }

    pub fn with_process_all_modules(mut self, enable: bool) -> Self {
        self.process_all_modules = enable;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn with_first_match_only(mut self, enable: bool) -> Self {
        self.first_match_only = enable;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Native scan flag word.
    pub fn native_flags(&self) -> c_int {
        let mut flags = 0;
        if self.fast_mode {
            flags |= ffi::SCAN_FLAGS_FAST_MODE;
        }
        if self.process_all_modules {
            flags |= ffi::SCAN_FLAGS_PROCESS_ALL_MODULES;
        }
        if self.report_non_matching {
            flags |= ffi::SCAN_FLAGS_REPORT_RULES_NOT_MATCHING;
        }
        flags
    }

    /// Native timeout in whole seconds, `0` for none.
    pub fn native_timeout(&self) -> c_int {
        self.timeout.map_or(0, |timeout| {
            let secs = ceil_secs(timeout);
            c_int::try_from(secs).unwrap_or(c_int::MAX)
        })
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

mod timeout_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(timeout: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match timeout {
            Some(timeout) => serializer.serialize_some(&super::ceil_secs(*timeout)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs))
    }
}

fn default_symbol_prefix() -> String {
    ffi::DEFAULT_SYMBOL_PREFIX.to_string()
}

/// Where to find the native engine and how to scan with it.
///
/// # Examples
///
/// ```rust
/// use rulebridge::EngineConfig;
///
/// let config = EngineConfig::from_yaml_str(
///     "library_path: /usr/lib/librulebridge-engine.so\nscan:\n  fast_mode: true\n  timeout: 10\n",
/// )
/// .unwrap();
/// assert_eq!(config.symbol_prefix, "rb_");
/// assert!(config.scan.fast_mode);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub library_path: Option<PathBuf>,
    /// Prefix of every exported engine symbol.
    #[serde(default = "default_symbol_prefix")]
    pub symbol_prefix: String,
    /// Default options for scans that do not pass their own.
    pub scan: ScanConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            library_path: None,
            symbol_prefix: default_symbol_prefix(),
            scan: ScanConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path = Some(path.into());
        self
    }

    pub fn with_symbol_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.symbol_prefix = prefix.into();
        self
    }

    pub fn with_scan(mut self, scan: ScanConfig) -> Self {
        self.scan = scan;
        self
    }

    pub fn from_yaml_str(source: &str) -> Result<Self> {
        serde_yaml::from_str(source).map_err(|e| BridgeError::Config(e.to_string()))
    }

    pub fn from_json_str(source: &str) -> Result<Self> {
        serde_json::from_str(source).map_err(|e| BridgeError::Config(e.to_string()))
    }

    /// Load from a file; `.json` files are parsed as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&source)
        } else {
            Self::from_yaml_str(&source)
        }
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| BridgeError::Config(e.to_string()))
    }
}
