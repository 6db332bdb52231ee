//! Native engine handle.
//!
//! An [`Engine`] owns one [`EngineApi`] function table and, when the table was
//! resolved from a shared library, the `dlopen` handle that keeps the library
//! mapped. Every compiler and ruleset holds an `Arc<Engine>`, so the library
//! cannot be unloaded while a native handle created by it is still alive.

use crate::error::{BridgeError, Result};
use crate::ffi::{self, EngineApi};
use std::fmt;
use std::sync::Arc;

#[cfg(unix)]
use crate::config::EngineConfig;
#[cfg(unix)]
use std::ffi::{CStr, CString};
#[cfg(unix)]
use std::os::raw::c_void;
#[cfg(unix)]
use std::path::Path;
#[cfg(unix)]
use std::ptr::NonNull;

/// A loaded, initialized native engine.
pub struct Engine {
    api: EngineApi,
    label: String,
    /// Keeps the shared library mapped until the engine is dropped.
    #[cfg(unix)]
    _library: Option<Library>,
}

impl Engine {
    /// Wrap a function table supplied by the caller.
    ///
    /// # Safety
    /// Every function in `api` must implement the contract documented in
    /// [`crate::ffi`] and remain callable for as long as the returned engine
    /// (or any compiler or ruleset created from it) is alive.
    pub unsafe fn from_api(api: EngineApi, label: impl Into<String>) -> Result<Arc<Self>> {
        let engine = Self {
            api,
            label: label.into(),
            #[cfg(unix)]
            _library: None,
        };
        engine.start()
    }

    /// Wrap a function table whose `initialize` cannot fail. A failure status
    /// is logged instead of returned.
    ///
    /// # Safety
    /// Same contract as [`Engine::from_api`].
    #[cfg(feature = "mock")]
    pub(crate) unsafe fn from_trusted_api(api: EngineApi, label: &str) -> Arc<Self> {
        if let Some(initialize) = api.initialize {
            let status = initialize();
            if status != ffi::ERROR_SUCCESS {
                tracing::warn!(engine = label, status, "native engine initialize failed");
            }
        }
        tracing::debug!(engine = label, "native engine initialized");
        Arc::new(Self {
            api,
            label: label.to_string(),
            #[cfg(unix)]
            _library: None,
        })
    }

    /// Load an engine from a shared library exporting `<prefix><name>` symbols.
    ///
    /// The library must export `<prefix>abi_version` returning
    /// [`ffi::ABI_VERSION`]; anything else is refused before other symbols
    /// are resolved.
    ///
    /// # Safety
    /// Loading a library runs its initializers, and the resolved symbols are
    /// trusted to have the signatures declared in [`EngineApi`].
    #[cfg(unix)]
    pub unsafe fn load(path: impl AsRef<Path>, symbol_prefix: &str) -> Result<Arc<Self>> {
        use std::os::unix::ffi::OsStrExt;

        let path = path.as_ref();
        let path_c = CString::new(path.as_os_str().as_bytes())?;

        let handle = libc::dlopen(path_c.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL);
        let library = match NonNull::new(handle) {
            Some(handle) => Library { handle },
            None => return Err(BridgeError::EngineLoad(dlerror_message())),
        };

        let api = library.resolve_api(symbol_prefix)?;
        let engine = Self {
            api,
            label: path.display().to_string(),
            _library: Some(library),
        };
        engine.start()
    }

    /// Load the engine named by `config.library_path`.
    ///
    /// # Safety
    /// Same contract as [`Engine::load`].
    #[cfg(unix)]
    pub unsafe fn from_config(config: &EngineConfig) -> Result<Arc<Self>> {
        let path = config
            .library_path
            .as_ref()
            .ok_or_else(|| BridgeError::Config("library_path is not set".to_string()))?;
        Self::load(path, &config.symbol_prefix)
    }

    unsafe fn start(self) -> Result<Arc<Self>> {
        if let Some(initialize) = self.api.initialize {
            BridgeError::check(initialize())?;
        }
        tracing::debug!(engine = %self.label, "native engine initialized");
        Ok(Arc::new(self))
    }

    pub(crate) fn api(&self) -> &EngineApi {
        &self.api
    }

    /// Library path, or the label given to [`Engine::from_api`].
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(finalize) = self.api.finalize {
            let status = unsafe { finalize() };
            if status != ffi::ERROR_SUCCESS {
                tracing::warn!(engine = %self.label, status, "native engine finalize failed");
            }
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("label", &self.label)
            .field("api", &self.api)
            .finish()
    }
}

/// `dlopen` handle; `dlclose` runs on drop, after the engine has finalized.
#[cfg(unix)]
struct Library {
    handle: NonNull<c_void>,
}

// dlopen handles are process-global.
#[cfg(unix)]
unsafe impl Send for Library {}
#[cfg(unix)]
unsafe impl Sync for Library {}

#[cfg(unix)]
impl Drop for Library {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle.as_ptr());
        }
    }
}

#[cfg(unix)]
impl Library {
    unsafe fn lookup(&self, prefix: &str, name: &str) -> Result<*mut c_void> {
        let symbol = CString::new(format!("{prefix}{name}"))?;
        Ok(libc::dlsym(self.handle.as_ptr(), symbol.as_ptr()))
    }

    unsafe fn symbol<F: Copy>(&self, prefix: &str, name: &str) -> Result<F> {
        self.optional_symbol(prefix, name)?
            .ok_or_else(|| BridgeError::EngineLoad(format!("missing symbol {prefix}{name}")))
    }

    unsafe fn optional_symbol<F: Copy>(&self, prefix: &str, name: &str) -> Result<Option<F>> {
        debug_assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*mut c_void>()
        );
        let ptr = self.lookup(prefix, name)?;
        if ptr.is_null() {
            return Ok(None);
        }
        Ok(Some(std::mem::transmute_copy::<*mut c_void, F>(&ptr)))
    }

    /// Refuse libraries that do not declare this ABI, including engines
    /// whose other exports happen to share names with it.
    unsafe fn check_abi_version(&self, prefix: &str) -> Result<()> {
        let abi_version: ffi::AbiVersionFn = self
            .optional_symbol(prefix, "abi_version")?
            .ok_or_else(|| {
                BridgeError::EngineLoad(format!(
                    "{prefix}abi_version is not exported; not a rulebridge engine library"
                ))
            })?;
        let version = abi_version();
        if version != ffi::ABI_VERSION {
            return Err(BridgeError::EngineLoad(format!(
                "engine ABI version {version}, expected {}",
                ffi::ABI_VERSION
            )));
        }
        Ok(())
    }

    unsafe fn resolve_api(&self, prefix: &str) -> Result<EngineApi> {
        self.check_abi_version(prefix)?;
        let mut missing = Vec::new();
        for name in ffi::REQUIRED_SYMBOLS {
            if self.lookup(prefix, name)?.is_null() {
                missing.push(format!("{prefix}{name}"));
            }
        }
        if !missing.is_empty() {
            return Err(BridgeError::EngineLoad(format!(
                "missing symbols: {}",
                missing.join(", ")
            )));
        }

        Ok(EngineApi {
            initialize: self.optional_symbol(prefix, "initialize")?,
            finalize: self.optional_symbol(prefix, "finalize")?,
            compiler_create: self.symbol(prefix, "compiler_create")?,
            compiler_destroy: self.symbol(prefix, "compiler_destroy")?,
            compiler_set_callback: self.symbol(prefix, "compiler_set_callback")?,
            compiler_add_string: self.symbol(prefix, "compiler_add_string")?,
            compiler_define_integer_variable: self
                .symbol(prefix, "compiler_define_integer_variable")?,
            compiler_define_boolean_variable: self
                .symbol(prefix, "compiler_define_boolean_variable")?,
            compiler_define_float_variable: self.symbol(prefix, "compiler_define_float_variable")?,
            compiler_define_string_variable: self
                .symbol(prefix, "compiler_define_string_variable")?,
            compiler_get_rules: self.symbol(prefix, "compiler_get_rules")?,
            rules_destroy: self.symbol(prefix, "rules_destroy")?,
            rules_scan_mem: self.symbol(prefix, "rules_scan_mem")?,
            rules_scan_file: self.symbol(prefix, "rules_scan_file")?,
            rules_scan_fd: self.symbol(prefix, "rules_scan_fd")?,
            rules_save_stream: self.symbol(prefix, "rules_save_stream")?,
            rules_load_stream: self.symbol(prefix, "rules_load_stream")?,
        })
    }
}

#[cfg(unix)]
fn dlerror_message() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "dlopen failed".to_string()
    } else {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}
