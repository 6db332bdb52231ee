//! # rulebridge
//!
//! Safe Rust bindings over a native, C-ABI pattern-matching engine: compile
//! textual rule sets, scan buffers, files and descriptors against them, and
//! save or load the compiled state through ordinary readers and writers.
//!
//! The engine itself is an opaque collaborator reached through an
//! [`EngineApi`] function table, either resolved from a shared library with
//! [`Engine::load`] or supplied directly with [`Engine::from_api`]. An
//! in-process reference engine lives in the `mock` module, compiled only
//! with the `mock` cargo feature.
//!
//! ## Quick Start
//!
//! ```rust
//! use rulebridge::{mock, Rules, ScanConfig};
//!
//! let rules = Rules::compile(
//!     &mock::engine(),
//!     r#"
//! rule suspicious_marker : demo {
//!     meta:
//!         author = "analyst"
//!     strings:
//!         $marker = "EVIL" nocase fullword
//!     condition:
//!         $marker
//! }"#,
//!     None,
//! )?;
//!
//! let matches = rules.scan_mem(b"this is evil stuff", &ScanConfig::default())?;
//! assert_eq!(matches.len(), 1);
//! assert_eq!(matches[0].strings[0].offset, 8);
//! assert_eq!(matches[0].strings[0].data, b"evil");
//!
//! rules.release();
//! # Ok::<(), rulebridge::BridgeError>(())
//! ```
//!
//! ## Loading a native engine
//!
//! ```rust,no_run
//! use rulebridge::{Engine, EngineConfig, Rules};
//!
//! let config = EngineConfig::from_file("engine.yaml")?;
//! // Safety: the configured library implements the documented engine ABI.
//! let engine = unsafe { Engine::from_config(&config)? };
//! let rules = Rules::compile(&engine, "rule always { condition: true }", None)?;
//! let matches = rules.scan_file("/bin/ls", &config.scan)?;
//! println!("{} rule(s) matched", matches.len());
//! # Ok::<(), rulebridge::BridgeError>(())
//! ```
//!
//! ## Safety model
//!
//! Native code never holds a Rust reference. Per-call state is registered in
//! a process-wide [`registry`] and reaches the engine as an integer token;
//! callbacks resolve the token and copy everything they need before
//! returning. Native handles live in ownership wrappers that release them
//! exactly once, explicitly or when the last reference is dropped.

pub mod ffi;
pub mod engine;
pub mod error;
pub mod config;
pub mod matches;
pub mod registry;
pub mod compiler;
pub mod rules;
#[cfg(feature = "mock")]
pub mod mock;

mod callback;
mod handle;
mod stream;

// Engine and ABI
pub use engine::Engine;
pub use ffi::EngineApi;

// Compilation and scanning
pub use compiler::{Compiler, ExternalValue};
pub use rules::Rules;
pub use matches::{MatchRule, MatchString, Meta, MetaValue, RuleStatus, StringFlags};

// Configuration and errors
pub use config::{CancellationToken, EngineConfig, ScanConfig};
pub use error::{BridgeError, CompileDiagnostic, Result, Severity};
