//! In-process reference engine.
//!
//! The mock implements the native C ABI in Rust for a literal-only rule
//! subset: text strings with `nocase`, `wide`, `ascii` and `fullword`, and
//! conditions of the form `true`, `false`, `any of them`, `all of them`,
//! `$id`, `filesize == N` or a bare external variable. It is driven through the same
//! [`EngineApi`] table, callbacks and streams as a real engine library, which
//! makes it suitable for exercising the binding without one installed.
//!
//! Serialized rules are `RBMK`, a little-endian `u32` format version, then the
//! compiled sources and external variables.
//!
//! # Examples
//!
//! ```rust
//! use rulebridge::{mock, Rules, ScanConfig};
//!
//! let rules = Rules::compile(
//!     &mock::engine(),
//!     r#"rule greeting { strings: $a = "hello" condition: $a }"#,
//!     None,
//! )
//! .unwrap();
//! let matches = rules.scan_mem(b"well hello there", &ScanConfig::default()).unwrap();
//! assert_eq!(matches[0].rule, "greeting");
//! assert_eq!(matches[0].strings[0].offset, 5);
//! ```

mod native;
mod parser;

use crate::engine::Engine;
use crate::ffi::EngineApi;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Format version written by the mock's serializer.
pub const FORMAT_VERSION: u32 = native::FORMAT_VERSION;

/// Magic bytes opening serialized mock rules.
pub const MAGIC: &[u8; 4] = native::MAGIC;

static INITIALIZE_CALLS: AtomicUsize = AtomicUsize::new(0);
static FINALIZE_CALLS: AtomicUsize = AtomicUsize::new(0);
static LIVE_RULES: AtomicUsize = AtomicUsize::new(0);
static LIVE_COMPILERS: AtomicUsize = AtomicUsize::new(0);

/// The mock's function table.
pub fn api() -> EngineApi {
    EngineApi {
        initialize: Some(native::initialize),
        finalize: Some(native::finalize),
        compiler_create: native::compiler_create,
        compiler_destroy: native::compiler_destroy,
        compiler_set_callback: native::compiler_set_callback,
        compiler_add_string: native::compiler_add_string,
        compiler_define_integer_variable: native::compiler_define_integer_variable,
        compiler_define_boolean_variable: native::compiler_define_boolean_variable,
        compiler_define_float_variable: native::compiler_define_float_variable,
        compiler_define_string_variable: native::compiler_define_string_variable,
        compiler_get_rules: native::compiler_get_rules,
        rules_destroy: native::rules_destroy,
        rules_scan_mem: native::rules_scan_mem,
        rules_scan_file: native::rules_scan_file,
        rules_scan_fd: native::rules_scan_fd,
        rules_save_stream: native::rules_save_stream,
        rules_load_stream: native::rules_load_stream,
    }
}

/// Shared process-wide mock engine, labelled `mock`.
pub fn engine() -> Arc<Engine> {
    static ENGINE: OnceLock<Arc<Engine>> = OnceLock::new();
    Arc::clone(ENGINE.get_or_init(|| unsafe { Engine::from_trusted_api(api(), "mock") }))
}

pub fn initialize_calls() -> usize {
    INITIALIZE_CALLS.load(Ordering::SeqCst)
}

pub fn finalize_calls() -> usize {
    FINALIZE_CALLS.load(Ordering::SeqCst)
}

/// Compiled rulesets created by the mock and not yet destroyed.
pub fn live_rules() -> usize {
    LIVE_RULES.load(Ordering::SeqCst)
}

/// Compilers created by the mock and not yet destroyed.
pub fn live_compilers() -> usize {
    LIVE_COMPILERS.load(Ordering::SeqCst)
}
