//! Compiled rulesets: scanning, serialization and release.
//!
//! Every scan variant funnels through one routine that registers a fresh
//! scan context, hands its token and the scan callback to the
//! engine, unregisters the context and translates the status. Serialization
//! does the same with a stream context and the stream adapter.
//!
//! # Examples
//!
//! ```rust
//! use rulebridge::{mock, Rules, ScanConfig};
//!
//! let engine = mock::engine();
//! let rules = Rules::compile(
//!     &engine,
//!     r#"rule tagged : net { meta: score = 7 strings: $a = "GET /" condition: $a }"#,
//!     Some("http"),
//! )
//! .unwrap();
//!
//! let mut saved = Vec::new();
//! rules.write(&mut saved).unwrap();
//! let restored = Rules::read(&engine, &mut saved.as_slice()).unwrap();
//!
//! let matches = restored.scan_mem(b"GET / HTTP/1.1", &ScanConfig::default()).unwrap();
//! assert_eq!(matches[0].namespace, "http");
//! assert!(matches[0].has_tag("net"));
//!
//! assert!(rules.release());
//! assert!(!rules.release());
//! # restored.release();
//! ```

use crate::callback::{self, ScanContext};
use crate::compiler::Compiler;
use crate::config::ScanConfig;
use crate::engine::Engine;
use crate::error::{BridgeError, Result};
use crate::ffi::{EngineApi, RawRules, ScanCallback};
use crate::handle::{OwnedHandle, RulesKind};
use crate::matches::MatchRule;
use crate::registry::{self, Registered};
use crate::stream::{self, ReadContext, WriteContext};
use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::os::raw::{c_int, c_void};
use std::path::Path;
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// A compiled ruleset.
///
/// Clones share one native handle. The handle is destroyed by
/// [`Rules::release`] or, failing that, when the last clone is dropped.
#[derive(Clone)]
pub struct Rules {
    inner: Arc<OwnedHandle<RulesKind>>,
}

impl Rules {
    /// Compile a single source.
    pub fn compile(engine: &Arc<Engine>, source: &str, namespace: Option<&str>) -> Result<Self> {
        let mut compiler = Compiler::new(engine)?;
        compiler.add_string(source, namespace)?;
        compiler.into_rules()
    }

    /// # Safety
    /// `raw` must be a ruleset issued by `engine` that nothing else owns.
    pub(crate) unsafe fn from_raw(engine: Arc<Engine>, raw: *mut RawRules) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(OwnedHandle::bind(engine, raw)?),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        self.inner.engine()
    }

    pub fn scan_mem(&self, data: &[u8], config: &ScanConfig) -> Result<Vec<MatchRule>> {
        self.scan_with(config, |api, rules, flags, callback, user_data, timeout| unsafe {
            (api.rules_scan_mem)(rules, data.as_ptr(), data.len(), flags, callback, user_data, timeout)
        })
    }

    /// Scan a file by path; the engine opens and maps it.
    pub fn scan_file(&self, path: impl AsRef<Path>, config: &ScanConfig) -> Result<Vec<MatchRule>> {
        let path = path_to_cstring(path.as_ref())?;
        self.scan_with(config, |api, rules, flags, callback, user_data, timeout| unsafe {
            (api.rules_scan_file)(rules, path.as_ptr(), flags, callback, user_data, timeout)
        })
    }

    /// Scan an open file. The descriptor stays owned by the caller.
    #[cfg(unix)]
    pub fn scan_fd(&self, file: &impl AsRawFd, config: &ScanConfig) -> Result<Vec<MatchRule>> {
        let fd = file.as_raw_fd();
        self.scan_with(config, |api, rules, flags, callback, user_data, timeout| unsafe {
            (api.rules_scan_fd)(rules, fd, flags, callback, user_data, timeout)
        })
    }

    fn scan_with(
        &self,
        config: &ScanConfig,
        scan: impl FnOnce(&EngineApi, *mut RawRules, c_int, ScanCallback, *mut c_void, c_int) -> c_int,
    ) -> Result<Vec<MatchRule>> {
        let context = Registered::new(ScanContext::new(config));
        let token = context.token();
        let (status, unresolved) = registry::watch_unresolved(|| {
            self.inner.with(|api, rules| {
                scan(
                    api,
                    rules,
                    config.native_flags(),
                    callback::scan_callback,
                    context.user_data(),
                    config.native_timeout(),
                )
            })
        });
        let context = context.into_inner();
        if let Some(unresolved) = unresolved {
            return Err(BridgeError::UnknownToken(unresolved));
        }
        context.finish(status?, token)
    }

    /// Serialize through `writer`. The writer is flushed on success.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        let context = Registered::new(WriteContext::new(&mut *writer));
        let mut native = stream::writer_stream(&context);
        let (status, unresolved) = registry::watch_unresolved(|| {
            self.inner
                .with(|api, rules| unsafe { (api.rules_save_stream)(rules, &mut native) })
        });
        let WriteContext { error, bytes, .. } = context.into_inner();

        if let Some(token) = unresolved {
            return Err(BridgeError::UnknownToken(token));
        }
        if let Some(error) = error {
            return Err(error.into());
        }
        BridgeError::check(status?)?;
        writer.flush()?;
        tracing::debug!(bytes, "rules serialized");
        Ok(())
    }

    /// Deserialize a ruleset from `reader`.
    pub fn read<R: Read>(engine: &Arc<Engine>, reader: &mut R) -> Result<Self> {
        let context = Registered::new(ReadContext::new(reader));
        let mut native = stream::reader_stream(&context);
        let mut raw = std::ptr::null_mut();
        let (status, unresolved) = registry::watch_unresolved(|| unsafe {
            (engine.api().rules_load_stream)(&mut native, &mut raw)
        });
        let ReadContext { error, bytes, .. } = context.into_inner();

        // Own whatever the engine produced before looking at any error.
        let rules = if raw.is_null() {
            None
        } else {
            Some(unsafe { Self::from_raw(Arc::clone(engine), raw) }?)
        };
        let failure = match (unresolved, error) {
            (Some(token), _) => Some(BridgeError::UnknownToken(token)),
            (None, Some(error)) => Some(BridgeError::from(error)),
            (None, None) => BridgeError::from_status(status),
        };

        match (failure, rules) {
            (None, Some(rules)) => {
                tracing::debug!(bytes, engine = %engine.label(), "rules deserialized");
                Ok(rules)
            }
            (Some(err), rules) => {
                if let Some(rules) = rules {
                    rules.release();
                }
                Err(err)
            }
            (None, None) => Err(BridgeError::InvalidArgument(
                "engine loaded no rules".to_string(),
            )),
        }
    }

    /// Serialize to a file at `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write(&mut writer)
    }

    /// Deserialize from a file at `path`.
    pub fn load(engine: &Arc<Engine>, path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::read(engine, &mut reader)
    }

    /// Destroy the native ruleset now. Waits for scans in flight; returns
    /// `false` when it was already released. Any later use of this ruleset
    /// or its clones fails with [`BridgeError::UseAfterRelease`].
    pub fn release(&self) -> bool {
        self.inner.release()
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_released()
    }
}

impl fmt::Debug for Rules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rules")
            .field("engine", &self.engine().label())
            .field("released", &self.is_released())
            .field("references", &Arc::strong_count(&self.inner))
            .finish()
    }
}

#[cfg(unix)]
fn path_to_cstring(path: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    Ok(CString::new(path.as_os_str().as_bytes())?)
}

#[cfg(not(unix))]
fn path_to_cstring(path: &Path) -> Result<CString> {
    let path = path
        .to_str()
        .ok_or_else(|| BridgeError::InvalidArgument(format!("path is not UTF-8: {}", path.display())))?;
    Ok(CString::new(path)?)
}
