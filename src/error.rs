//! Error types for the rulebridge crate.
//!
//! Every status code returned by a native entry point is translated into a
//! [`BridgeError`] at the boundary by [`BridgeError::from_status`]; callers
//! never see raw engine codes except inside [`BridgeError::Engine`].

use crate::ffi;
use serde::Serialize;
use std::fmt;
use std::os::raw::c_int;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Severity of a compiler diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub(crate) fn from_level(level: c_int) -> Self {
        if level == ffi::DIAGNOSTIC_WARNING {
            Severity::Warning
        } else {
            Severity::Error
        }
    }
}

/// One diagnostic reported by the native rule compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileDiagnostic {
    pub severity: Severity,
    /// File the diagnostic refers to, when the source came from a file.
    pub file: Option<String>,
    pub line: u32,
    pub message: String,
}

impl fmt::Display for CompileDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match &self.file {
            Some(file) => write!(f, "{file}:{}: {kind}: {}", self.line, self.message),
            None => write!(f, "line {}: {kind}: {}", self.line, self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("Compilation failed: {}", render_diagnostics(.0))]
    Compilation(Vec<CompileDiagnostic>),
    #[error("Insufficient memory")]
    InsufficientMemory,
    #[error("Could not open or map file")]
    CouldNotOpenOrMapFile,
    #[error("Corrupt serialized rules")]
    CorruptSerializedState,
    #[error("Unsupported serialized rules version")]
    UnsupportedFileVersion,
    #[error("Scan timed out")]
    ScanTimedOut,
    #[error("Scan cancelled")]
    ScanCancelled,
    #[error("Native handle used after release")]
    UseAfterRelease,
    #[error("Unknown registry token: {0}")]
    UnknownToken(usize),
    #[error("Engine error code: {0}")]
    Engine(i32),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Engine load error: {0}")]
    EngineLoad(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

fn render_diagnostics(diagnostics: &[CompileDiagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl BridgeError {
    /// Translate a native status code. Returns `None` for success.
    pub fn from_status(status: c_int) -> Option<Self> {
        let err = match status {
            ffi::ERROR_SUCCESS => return None,
            ffi::ERROR_INSUFFICIENT_MEMORY => BridgeError::InsufficientMemory,
            ffi::ERROR_COULD_NOT_OPEN_FILE | ffi::ERROR_COULD_NOT_MAP_FILE => {
                BridgeError::CouldNotOpenOrMapFile
            }
            ffi::ERROR_INVALID_FILE | ffi::ERROR_CORRUPT_FILE => {
                BridgeError::CorruptSerializedState
            }
            ffi::ERROR_UNSUPPORTED_FILE_VERSION => BridgeError::UnsupportedFileVersion,
            ffi::ERROR_SCAN_TIMEOUT => BridgeError::ScanTimedOut,
            other => BridgeError::Engine(other),
        };
        Some(err)
    }

    /// `Ok(())` on success, the translated error otherwise.
    pub fn check(status: c_int) -> Result<()> {
        match Self::from_status(status) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Diagnostics carried by a compilation failure.
    pub fn diagnostics(&self) -> &[CompileDiagnostic] {
        match self {
            BridgeError::Compilation(diagnostics) => diagnostics,
            _ => &[],
        }
    }

    /// Whether the error signals a violation of this crate's own invariants.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            BridgeError::UnknownToken(_) | BridgeError::UseAfterRelease
        )
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

impl From<std::ffi::NulError> for BridgeError {
    fn from(err: std::ffi::NulError) -> Self {
        BridgeError::InvalidArgument(format!(
            "interior NUL byte at position {}",
            err.nul_position()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    fn diagnostic(line: u32, message: &str) -> CompileDiagnostic {
        CompileDiagnostic {
            severity: Severity::Error,
            file: None,
            line,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_success_is_not_an_error() {
        assert_eq!(BridgeError::from_status(ffi::ERROR_SUCCESS), None);
        assert!(BridgeError::check(ffi::ERROR_SUCCESS).is_ok());
    }

    #[test]
    fn test_status_translation() {
        let cases = [
            (ffi::ERROR_INSUFFICIENT_MEMORY, BridgeError::InsufficientMemory),
            (ffi::ERROR_COULD_NOT_OPEN_FILE, BridgeError::CouldNotOpenOrMapFile),
            (ffi::ERROR_COULD_NOT_MAP_FILE, BridgeError::CouldNotOpenOrMapFile),
            (ffi::ERROR_INVALID_FILE, BridgeError::CorruptSerializedState),
            (ffi::ERROR_CORRUPT_FILE, BridgeError::CorruptSerializedState),
            (
                ffi::ERROR_UNSUPPORTED_FILE_VERSION,
                BridgeError::UnsupportedFileVersion,
            ),
            (ffi::ERROR_SCAN_TIMEOUT, BridgeError::ScanTimedOut),
            (ffi::ERROR_WRITING_STREAM, BridgeError::Engine(ffi::ERROR_WRITING_STREAM)),
            (9999, BridgeError::Engine(9999)),
        ];

        for (status, expected) in cases {
            assert_eq!(BridgeError::from_status(status), Some(expected.clone()));
            assert_eq!(BridgeError::check(status), Err(expected));
        }
    }

    #[test]
    fn test_compilation_error_lists_every_diagnostic() {
        let err = BridgeError::Compilation(vec![
            diagnostic(1, "syntax error"),
            diagnostic(7, "undefined string \"$b\""),
        ]);

        let rendered = err.to_string();
        assert!(rendered.contains("line 1: error: syntax error"));
        assert!(rendered.contains("line 7: error: undefined string \"$b\""));
        assert_eq!(err.diagnostics().len(), 2);
        assert!(err.source().is_none());
    }

    #[test]
    fn test_diagnostic_display_with_file() {
        let mut diag = diagnostic(3, "unreferenced string");
        diag.severity = Severity::Warning;
        diag.file = Some("rules/base.yar".to_string());
        assert_eq!(
            diag.to_string(),
            "rules/base.yar:3: warning: unreferenced string"
        );
    }

    #[test]
    fn test_severity_from_level() {
        assert_eq!(Severity::from_level(ffi::DIAGNOSTIC_ERROR), Severity::Error);
        assert_eq!(
            Severity::from_level(ffi::DIAGNOSTIC_WARNING),
            Severity::Warning
        );
    }

    #[test]
    fn test_internal_errors() {
        assert!(BridgeError::UnknownToken(4).is_internal());
        assert!(BridgeError::UseAfterRelease.is_internal());
        assert!(!BridgeError::ScanTimedOut.is_internal());
        assert!(BridgeError::ScanTimedOut.diagnostics().is_empty());
    }

    #[test]
    fn test_from_io_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::WriteZero, "disk full");
        let err: BridgeError = io_error.into();

        match err {
            BridgeError::Io(msg) => assert!(msg.contains("disk full")),
            _ => panic!("Expected Io variant"),
        }
    }

    #[test]
    fn test_from_nul_error() {
        let nul = std::ffi::CString::new("ab\0c").unwrap_err();
        let err: BridgeError = nul.into();
        assert_eq!(
            err,
            BridgeError::InvalidArgument("interior NUL byte at position 2".to_string())
        );
    }

    #[test]
    fn test_error_display() {
        assert_eq!(BridgeError::UnknownToken(42).to_string(), "Unknown registry token: 42");
        assert_eq!(BridgeError::Engine(27).to_string(), "Engine error code: 27");
        assert_eq!(
            BridgeError::UseAfterRelease.to_string(),
            "Native handle used after release"
        );
    }
}
