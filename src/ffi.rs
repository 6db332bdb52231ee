//! C-ABI surface of the native rule engine.
//!
//! The binding never dereferences engine handles; it only passes them back
//! into the entry points collected in [`EngineApi`]. Everything the engine
//! hands to the binding (scan events, diagnostics, stream requests) arrives
//! through the callback types declared here together with an opaque
//! `user_data` word, which always carries a registry token.

use std::os::raw::{c_char, c_int, c_void};

/// Version of the event, stream and callback layouts declared here. A shared
/// library must export `<prefix>abi_version` returning this value before any
/// other symbol is trusted.
pub const ABI_VERSION: u32 = 1;

/// Default prefix of exported engine symbols.
pub const DEFAULT_SYMBOL_PREFIX: &str = "rb_";

pub type AbiVersionFn = unsafe extern "C" fn() -> u32;

// Status codes.
pub const ERROR_SUCCESS: c_int = 0;
pub const ERROR_INSUFFICIENT_MEMORY: c_int = 1;
pub const ERROR_COULD_NOT_OPEN_FILE: c_int = 3;
pub const ERROR_COULD_NOT_MAP_FILE: c_int = 4;
pub const ERROR_INVALID_FILE: c_int = 6;
pub const ERROR_CORRUPT_FILE: c_int = 7;
pub const ERROR_UNSUPPORTED_FILE_VERSION: c_int = 8;
pub const ERROR_SCAN_TIMEOUT: c_int = 26;
pub const ERROR_CALLBACK_ERROR: c_int = 27;
pub const ERROR_INVALID_ARGUMENT: c_int = 29;
pub const ERROR_COMPILER_ERROR: c_int = 30;
pub const ERROR_WRITING_STREAM: c_int = 40;

// Scan callback messages.
pub const EVENT_RULE_MATCHING: c_int = 1;
pub const EVENT_RULE_NOT_MATCHING: c_int = 2;
pub const EVENT_STRING_MATCH: c_int = 3;
pub const EVENT_SCAN_FINISHED: c_int = 4;

// Scan callback return values.
pub const CALLBACK_CONTINUE: c_int = 0;
pub const CALLBACK_ABORT: c_int = 1;
pub const CALLBACK_ERROR: c_int = 2;

// Scan flags.
pub const SCAN_FLAGS_FAST_MODE: c_int = 1;
pub const SCAN_FLAGS_PROCESS_ALL_MODULES: c_int = 2;
pub const SCAN_FLAGS_REPORT_RULES_NOT_MATCHING: c_int = 16;

// String flags carried by string match events.
pub const STRING_FLAGS_NOCASE: u32 = 1;
pub const STRING_FLAGS_WIDE: u32 = 2;
pub const STRING_FLAGS_ASCII: u32 = 4;
pub const STRING_FLAGS_FULLWORD: u32 = 8;
pub const STRING_FLAGS_HEX: u32 = 16;
pub const STRING_FLAGS_REGEXP: u32 = 32;

// Compiler diagnostic levels.
pub const DIAGNOSTIC_ERROR: c_int = 0;
pub const DIAGNOSTIC_WARNING: c_int = 1;

// Metadata value kinds.
pub const META_TYPE_INTEGER: c_int = 1;
pub const META_TYPE_STRING: c_int = 2;
pub const META_TYPE_BOOLEAN: c_int = 3;

/// Opaque compiled ruleset.
#[repr(C)]
pub struct RawRules {
    _opaque: [u8; 0],
}

/// Opaque in-progress compilation context.
#[repr(C)]
pub struct RawCompiler {
    _opaque: [u8; 0],
}

/// One metadata entry of a rule.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawMeta {
    pub identifier: *const c_char,
    pub kind: c_int,
    /// Value for integer and boolean entries.
    pub integer: i64,
    /// Value for string entries.
    pub string: *const c_char,
}

/// Event record handed to the scan callback.
///
/// Every pointer may be null and every count may be zero; the receiver treats
/// missing fields as empty. All memory is engine-owned and only valid for the
/// duration of the callback invocation.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawScanEvent {
    pub rule: *const c_char,
    pub namespace: *const c_char,
    pub tags: *const *const c_char,
    pub tag_count: usize,
    pub metas: *const RawMeta,
    pub meta_count: usize,
    pub string_id: *const c_char,
    pub offset: u64,
    pub data: *const u8,
    pub data_length: usize,
    pub string_flags: u32,
}

impl RawScanEvent {
    pub const fn empty() -> Self {
        Self {
            rule: std::ptr::null(),
            namespace: std::ptr::null(),
            tags: std::ptr::null(),
            tag_count: 0,
            metas: std::ptr::null(),
            meta_count: 0,
            string_id: std::ptr::null(),
            offset: 0,
            data: std::ptr::null(),
            data_length: 0,
            string_flags: 0,
        }
    }
}

pub type ScanCallback =
    unsafe extern "C" fn(message: c_int, event: *const RawScanEvent, user_data: *mut c_void) -> c_int;

pub type CompilerCallback = unsafe extern "C" fn(
    level: c_int,
    file_name: *const c_char,
    line: c_int,
    message: *const c_char,
    user_data: *mut c_void,
);

pub type StreamReadFn =
    unsafe extern "C" fn(ptr: *mut c_void, size: usize, count: usize, user_data: *mut c_void) -> usize;

pub type StreamWriteFn = unsafe extern "C" fn(
    ptr: *const c_void,
    size: usize,
    count: usize,
    user_data: *mut c_void,
) -> usize;

/// Byte stream the engine saves compiled rules to and loads them from.
#[repr(C)]
pub struct NativeStream {
    pub user_data: *mut c_void,
    pub read: Option<StreamReadFn>,
    pub write: Option<StreamWriteFn>,
}

/// Function table of the native engine.
///
/// Obtained either from a shared library (see [`crate::Engine::load`]) or
/// supplied by a caller that links the engine directly.
#[derive(Clone, Copy)]
pub struct EngineApi {
    pub initialize: Option<unsafe extern "C" fn() -> c_int>,
    pub finalize: Option<unsafe extern "C" fn() -> c_int>,
    pub compiler_create: unsafe extern "C" fn(compiler: *mut *mut RawCompiler) -> c_int,
    pub compiler_destroy: unsafe extern "C" fn(compiler: *mut RawCompiler),
    pub compiler_set_callback: unsafe extern "C" fn(
        compiler: *mut RawCompiler,
        callback: Option<CompilerCallback>,
        user_data: *mut c_void,
    ),
    /// Returns the number of errors found in `source`.
    pub compiler_add_string: unsafe extern "C" fn(
        compiler: *mut RawCompiler,
        source: *const c_char,
        namespace: *const c_char,
    ) -> c_int,
    pub compiler_define_integer_variable:
        unsafe extern "C" fn(compiler: *mut RawCompiler, identifier: *const c_char, value: i64) -> c_int,
    pub compiler_define_boolean_variable:
        unsafe extern "C" fn(compiler: *mut RawCompiler, identifier: *const c_char, value: c_int) -> c_int,
    pub compiler_define_float_variable:
        unsafe extern "C" fn(compiler: *mut RawCompiler, identifier: *const c_char, value: f64) -> c_int,
    pub compiler_define_string_variable: unsafe extern "C" fn(
        compiler: *mut RawCompiler,
        identifier: *const c_char,
        value: *const c_char,
    ) -> c_int,
    pub compiler_get_rules:
        unsafe extern "C" fn(compiler: *mut RawCompiler, rules: *mut *mut RawRules) -> c_int,
    pub rules_destroy: unsafe extern "C" fn(rules: *mut RawRules) -> c_int,
    pub rules_scan_mem: unsafe extern "C" fn(
        rules: *mut RawRules,
        buffer: *const u8,
        buffer_size: usize,
        flags: c_int,
        callback: ScanCallback,
        user_data: *mut c_void,
        timeout: c_int,
    ) -> c_int,
    pub rules_scan_file: unsafe extern "C" fn(
        rules: *mut RawRules,
        filename: *const c_char,
        flags: c_int,
        callback: ScanCallback,
        user_data: *mut c_void,
        timeout: c_int,
    ) -> c_int,
    pub rules_scan_fd: unsafe extern "C" fn(
        rules: *mut RawRules,
        fd: c_int,
        flags: c_int,
        callback: ScanCallback,
        user_data: *mut c_void,
        timeout: c_int,
    ) -> c_int,
    pub rules_save_stream: unsafe extern "C" fn(rules: *mut RawRules, stream: *mut NativeStream) -> c_int,
    pub rules_load_stream:
        unsafe extern "C" fn(stream: *mut NativeStream, rules: *mut *mut RawRules) -> c_int,
}

impl std::fmt::Debug for EngineApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineApi")
            .field("initialize", &self.initialize.is_some())
            .field("finalize", &self.finalize.is_some())
            .finish_non_exhaustive()
    }
}

/// Symbol names resolved from a shared library, without the prefix.
pub const REQUIRED_SYMBOLS: [&str; 15] = [
    "compiler_create",
    "compiler_destroy",
    "compiler_set_callback",
    "compiler_add_string",
    "compiler_define_integer_variable",
    "compiler_define_boolean_variable",
    "compiler_define_float_variable",
    "compiler_define_string_variable",
    "compiler_get_rules",
    "rules_destroy",
    "rules_scan_mem",
    "rules_scan_file",
    "rules_scan_fd",
    "rules_save_stream",
    "rules_load_stream",
];
