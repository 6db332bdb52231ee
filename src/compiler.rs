//! Rule compilation.
//!
//! A [`Compiler`] owns one native compilation context. Sources are added one
//! call at a time; every diagnostic the engine reports during a call is
//! collected through the compiler callback, so a failing call returns all of
//! its errors at once rather than only the first.
//!
//! # Examples
//!
//! ```rust
//! use rulebridge::{mock, Compiler};
//!
//! let mut compiler = Compiler::new(&mock::engine()).unwrap();
//! compiler.define_variable("is_sample", true).unwrap();
//! compiler
//!     .add_string("rule sample { condition: is_sample }", Some("triage"))
//!     .unwrap();
//! let rules = compiler.into_rules().unwrap();
//! # rules.release();
//! ```

use crate::callback::{self, CompileContext};
use crate::engine::Engine;
use crate::error::{BridgeError, CompileDiagnostic, Result, Severity};
use crate::handle::{CompilerKind, OwnedHandle};
use crate::registry::{self, Registered};
use crate::rules::Rules;
use std::ffi::CString;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;

/// Value of an external variable referenced by rule conditions.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalValue {
    Integer(i64),
    Boolean(bool),
    Float(f64),
    String(String),
}

impl From<i64> for ExternalValue {
    fn from(value: i64) -> Self {
        ExternalValue::Integer(value)
    }
}

impl From<bool> for ExternalValue {
    fn from(value: bool) -> Self {
        ExternalValue::Boolean(value)
    }
}

impl From<f64> for ExternalValue {
    fn from(value: f64) -> Self {
        ExternalValue::Float(value)
    }
}

impl From<&str> for ExternalValue {
    fn from(value: &str) -> Self {
        ExternalValue::String(value.to_string())
    }
}

impl From<String> for ExternalValue {
    fn from(value: String) -> Self {
        ExternalValue::String(value)
    }
}

pub struct Compiler {
    handle: OwnedHandle<CompilerKind>,
    // Unregistered after the native compiler, which holds its token, is gone.
    context: Registered<CompileContext>,
    failed: bool,
}

impl Compiler {
    pub fn new(engine: &Arc<Engine>) -> Result<Self> {
        let mut raw = std::ptr::null_mut();
        BridgeError::check(unsafe { (engine.api().compiler_create)(&mut raw) })?;
        let handle = unsafe { OwnedHandle::<CompilerKind>::bind(Arc::clone(engine), raw) }?;

        let context = Registered::new(CompileContext::default());
        handle.with(|api, raw| unsafe {
            (api.compiler_set_callback)(raw, Some(callback::compiler_callback), context.user_data())
        })?;

        Ok(Self {
            handle,
            context,
            failed: false,
        })
    }

    /// Compile `source` into `namespace` (the engine's default when `None`).
    ///
    /// Once a call has failed the compiler refuses further sources and
    /// [`Compiler::into_rules`] reports every error seen.
    pub fn add_string(&mut self, source: &str, namespace: Option<&str>) -> Result<()> {
        if self.failed {
            return Err(BridgeError::Compilation(self.errors()));
        }
        let source_c = CString::new(source)?;
        let namespace_c = namespace.map(CString::new).transpose()?;

        let seen = self.context.get().diagnostics().len();
        let (error_count, unresolved) = registry::watch_unresolved(|| {
            self.handle.with(|api, raw| unsafe {
                (api.compiler_add_string)(
                    raw,
                    source_c.as_ptr(),
                    namespace_c.as_ref().map_or(std::ptr::null(), |ns| ns.as_ptr()),
                )
            })
        });
        let error_count = error_count?;

        // Diagnostics went to a token that resolves to nothing.
        if let Some(token) = unresolved {
            self.failed |= error_count > 0;
            tracing::error!(token, "compiler diagnostics were lost");
            return Err(BridgeError::UnknownToken(token));
        }

        let reported = &self.context.get().diagnostics()[seen..];
        if error_count > 0 {
            self.failed = true;
            let mut errors: Vec<_> = reported
                .iter()
                .filter(|d| d.severity == Severity::Error)
                .cloned()
                .collect();
            if errors.is_empty() {
                errors.push(unreported_errors(error_count));
            }
            tracing::debug!(errors = errors.len(), namespace, "rule source rejected");
            return Err(BridgeError::Compilation(errors));
        }

        tracing::debug!(
            warnings = reported.len(),
            namespace,
            bytes = source.len(),
            "rule source added"
        );
        Ok(())
    }

    /// Compile the contents of `path`; diagnostics carry the file name.
    pub fn add_file(&mut self, path: impl AsRef<Path>, namespace: Option<&str>) -> Result<()> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        self.context.get_mut().current_file = Some(path.display().to_string());
        let result = self.add_string(&source, namespace);
        self.context.get_mut().current_file = None;
        result
    }

    /// Define an external variable. Definitions must precede the sources
    /// that reference them.
    pub fn define_variable(&mut self, identifier: &str, value: impl Into<ExternalValue>) -> Result<()> {
        let identifier = CString::new(identifier)?;
        let status = match value.into() {
            ExternalValue::Integer(value) => self.handle.with(|api, raw| unsafe {
                (api.compiler_define_integer_variable)(raw, identifier.as_ptr(), value)
            })?,
            ExternalValue::Boolean(value) => self.handle.with(|api, raw| unsafe {
                (api.compiler_define_boolean_variable)(raw, identifier.as_ptr(), c_int::from(value))
            })?,
            ExternalValue::Float(value) => self.handle.with(|api, raw| unsafe {
                (api.compiler_define_float_variable)(raw, identifier.as_ptr(), value)
            })?,
            ExternalValue::String(value) => {
                let value = CString::new(value)?;
                self.handle.with(|api, raw| unsafe {
                    (api.compiler_define_string_variable)(raw, identifier.as_ptr(), value.as_ptr())
                })?
            }
        };
        BridgeError::check(status)
    }

    /// Every diagnostic reported so far, in order.
    pub fn diagnostics(&self) -> &[CompileDiagnostic] {
        self.context.get().diagnostics()
    }

    pub fn warnings(&self) -> Vec<CompileDiagnostic> {
        self.diagnostics_of(Severity::Warning)
    }

    fn errors(&self) -> Vec<CompileDiagnostic> {
        self.diagnostics_of(Severity::Error)
    }

    fn diagnostics_of(&self, severity: Severity) -> Vec<CompileDiagnostic> {
        self.diagnostics()
            .iter()
            .filter(|d| d.severity == severity)
            .cloned()
            .collect()
    }

    /// Finish compilation and take the compiled ruleset.
    pub fn into_rules(self) -> Result<Rules> {
        if self.failed {
            let mut errors = self.errors();
            if errors.is_empty() {
                errors.push(unreported_errors(1));
            }
            return Err(BridgeError::Compilation(errors));
        }

        let mut raw = std::ptr::null_mut();
        let status = self
            .handle
            .with(|api, compiler| unsafe { (api.compiler_get_rules)(compiler, &mut raw) })?;
        BridgeError::check(status)?;
        let rules = unsafe { Rules::from_raw(Arc::clone(self.handle.engine()), raw) }?;
        tracing::debug!(
            warnings = self.warnings().len(),
            engine = %self.handle.engine().label(),
            "rules compiled"
        );
        Ok(rules)
    }
}

impl Drop for Compiler {
    fn drop(&mut self) {
        self.handle.release();
    }
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("handle", &self.handle)
            .field("diagnostics", &self.diagnostics().len())
            .field("failed", &self.failed)
            .finish()
    }
}

fn unreported_errors(count: c_int) -> CompileDiagnostic {
    CompileDiagnostic {
        severity: Severity::Error,
        file: None,
        line: 0,
        message: format!("engine reported {count} error(s) without diagnostics"),
    }
}
