//! C-ABI entry points of the mock engine.
//!
//! Handles are boxed Rust values cast to the opaque engine types. Nothing in
//! here knows about the registry: callbacks and streams are driven exactly as
//! a foreign engine would drive them.

use super::parser::{self, Condition, Diagnostic, MetaLiteral, RuleDef};
use super::{LIVE_COMPILERS, LIVE_RULES};
use crate::ffi::{
    self, CompilerCallback, NativeStream, RawCompiler, RawMeta, RawRules, RawScanEvent, ScanCallback,
};
use aho_corasick::{AhoCorasick, MatchKind};
use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::ops::Range;
use std::os::raw::{c_char, c_int, c_void};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

pub(super) const MAGIC: &[u8; 4] = b"RBMK";
pub(super) const FORMAT_VERSION: u32 = 1;

const WRITE_CHUNK: usize = 64;
const MAX_SECTION: usize = 64 << 20;
const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, PartialEq)]
enum External {
    Integer(i64),
    Boolean(bool),
    Float(f64),
    String(Vec<u8>),
}

impl External {
    fn is_truthy(&self) -> bool {
        match self {
            External::Integer(value) => *value != 0,
            External::Boolean(value) => *value,
            External::Float(value) => *value != 0.0,
            External::String(value) => !value.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Source {
    namespace: String,
    text: String,
}

struct MockCompiler {
    callback: Option<CompilerCallback>,
    user_data: *mut c_void,
    sources: Vec<Source>,
    rule_names: HashSet<(String, String)>,
    externals: Vec<(String, External)>,
    errors: usize,
}

impl MockCompiler {
    fn report(&self, level: c_int, diagnostic: &Diagnostic) {
        let Some(callback) = self.callback else {
            return;
        };
        if let Ok(message) = CString::new(diagnostic.message.replace('\0', "")) {
            let line = c_int::try_from(diagnostic.line).unwrap_or(c_int::MAX);
            unsafe { callback(level, std::ptr::null(), line, message.as_ptr(), self.user_data) };
        }
    }

    fn define(&mut self, identifier: *const c_char, value: External) -> c_int {
        if identifier.is_null() {
            return ffi::ERROR_INVALID_ARGUMENT;
        }
        let name = unsafe { CStr::from_ptr(identifier) }.to_string_lossy().into_owned();
        if name.is_empty() {
            return ffi::ERROR_INVALID_ARGUMENT;
        }
        match self.externals.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.externals.push((name, value)),
        }
        ffi::ERROR_SUCCESS
    }
}

struct CompiledString {
    identifier: CString,
    matcher: AhoCorasick,
    /// Per automaton pattern: whether it is the wide variant.
    wide: Vec<bool>,
    fullword: bool,
    flags: u32,
}

impl CompiledString {
    /// Every occurrence, overlapping ones included, ordered by start offset.
    /// `first_only` keeps just the earliest.
    fn find(&self, data: &[u8], first_only: bool) -> Vec<Range<usize>> {
        let mut found: Vec<Range<usize>> = self
            .matcher
            .find_overlapping_iter(data)
            .filter(|m| {
                let wide = self.wide.get(m.pattern().as_usize()).copied().unwrap_or(false);
                !self.fullword || is_word_bounded(data, m.start(), m.end(), wide)
            })
            .map(|m| m.start()..m.end())
            .collect();
        found.sort_by_key(|range| (range.start, range.end));
        found.dedup();
        if first_only {
            found.truncate(1);
        }
        found
    }
}

fn is_word_bounded(data: &[u8], start: usize, end: usize, wide: bool) -> bool {
    let (before, after) = if wide {
        (
            (start >= 2 && data[start - 1] == 0).then(|| data[start - 2]),
            (end + 1 < data.len() && data[end + 1] == 0).then(|| data[end]),
        )
    } else {
        (start.checked_sub(1).map(|i| data[i]), data.get(end).copied())
    };
    !before.map_or(false, |b| b.is_ascii_alphanumeric()) && !after.map_or(false, |b| b.is_ascii_alphanumeric())
}

struct CompiledMeta {
    identifier: CString,
    kind: c_int,
    integer: i64,
    string: Option<CString>,
}

struct CompiledRule {
    name: CString,
    namespace: CString,
    tags: Vec<CString>,
    metas: Vec<CompiledMeta>,
    strings: Vec<CompiledString>,
    condition: Condition,
}

fn c_string(value: impl Into<Vec<u8>>, what: &str) -> Result<CString, String> {
    CString::new(value).map_err(|_| format!("{what} contains a NUL byte"))
}

fn compile_rule(namespace: &str, def: &RuleDef) -> Result<CompiledRule, String> {
    let mut strings = Vec::with_capacity(def.strings.len());
    for string in &def.strings {
        let mut patterns = Vec::new();
        let mut wide = Vec::new();
        if string.ascii || !string.wide {
            patterns.push(string.literal.clone());
            wide.push(false);
        }
        if string.wide {
            patterns.push(string.literal.iter().flat_map(|&b| [b, 0]).collect());
            wide.push(true);
        }
        let matcher = AhoCorasick::builder()
            .ascii_case_insensitive(string.nocase)
            .match_kind(MatchKind::Standard)
            .build(&patterns)
            .map_err(|e| format!("string \"{}\": {e}", string.identifier))?;

        let mut flags = 0;
        if string.nocase {
            flags |= ffi::STRING_FLAGS_NOCASE;
        }
        if string.wide {
            flags |= ffi::STRING_FLAGS_WIDE;
        }
        if string.ascii || !string.wide {
            flags |= ffi::STRING_FLAGS_ASCII;
        }
        if string.fullword {
            flags |= ffi::STRING_FLAGS_FULLWORD;
        }
        strings.push(CompiledString {
            identifier: c_string(string.identifier.as_str(), "string identifier")?,
            matcher,
            wide,
            fullword: string.fullword,
            flags,
        });
    }

    let mut metas = Vec::with_capacity(def.metas.len());
    for meta in &def.metas {
        let (kind, integer, string) = match &meta.value {
            MetaLiteral::Integer(value) => (ffi::META_TYPE_INTEGER, *value, None),
            MetaLiteral::Boolean(value) => (ffi::META_TYPE_BOOLEAN, i64::from(*value), None),
            MetaLiteral::String(value) => (
                ffi::META_TYPE_STRING,
                0,
                Some(c_string(value.clone(), &format!("meta \"{}\"", meta.identifier))?),
            ),
        };
        metas.push(CompiledMeta {
            identifier: c_string(meta.identifier.as_str(), "meta identifier")?,
            kind,
            integer,
            string,
        });
    }

    Ok(CompiledRule {
        name: c_string(def.name.as_str(), "rule name")?,
        namespace: c_string(namespace, "namespace")?,
        tags: def
            .tags
            .iter()
            .map(|tag| c_string(tag.as_str(), "tag"))
            .collect::<Result<_, _>>()?,
        metas,
        strings,
        condition: def.condition.clone(),
    })
}

struct MockRules {
    sources: Vec<Source>,
    externals: Vec<(String, External)>,
    rules: Vec<CompiledRule>,
}

impl MockRules {
    fn build(sources: Vec<Source>, externals: Vec<(String, External)>) -> Result<Self, String> {
        let mut rules = Vec::new();
        for source in &sources {
            let parsed = parser::parse(&source.text);
            if let Some(error) = parsed.errors.first() {
                return Err(format!("line {}: {}", error.line, error.message));
            }
            for def in &parsed.rules {
                rules.push(compile_rule(&source.namespace, def)?);
            }
        }
        Ok(Self {
            sources,
            externals,
            rules,
        })
    }

    fn evaluate(&self, rule: &CompiledRule, found: &[Vec<Range<usize>>], filesize: usize) -> bool {
        match &rule.condition {
            Condition::Constant(value) => *value,
            Condition::AnyOfThem => found.iter().any(|f| !f.is_empty()),
            Condition::AllOfThem => !found.is_empty() && found.iter().all(|f| !f.is_empty()),
            Condition::String(index) => found.get(*index).map_or(false, |f| !f.is_empty()),
            Condition::FilesizeEq(size) => filesize as u64 == *size,
            Condition::External(name) => self
                .externals
                .iter()
                .find(|(n, _)| n == name)
                .map_or(false, |(_, value)| value.is_truthy()),
        }
    }

    unsafe fn scan(
        &self,
        data: &[u8],
        flags: c_int,
        callback: ScanCallback,
        user_data: *mut c_void,
        timeout: c_int,
    ) -> c_int {
        let fast = flags & ffi::SCAN_FLAGS_FAST_MODE != 0;
        let report_not_matching = flags & ffi::SCAN_FLAGS_REPORT_RULES_NOT_MATCHING != 0;
        let deadline = u64::try_from(timeout)
            .ok()
            .filter(|secs| *secs > 0)
            .map(|secs| Instant::now() + Duration::from_secs(secs));

        for rule in &self.rules {
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                return ffi::ERROR_SCAN_TIMEOUT;
            }

            let found: Vec<_> = rule.strings.iter().map(|s| s.find(data, fast)).collect();
            let matching = self.evaluate(rule, &found, data.len());
            if !matching && !report_not_matching {
                continue;
            }

            let tags: Vec<*const c_char> = rule.tags.iter().map(|tag| tag.as_ptr()).collect();
            let metas: Vec<RawMeta> = rule
                .metas
                .iter()
                .map(|meta| RawMeta {
                    identifier: meta.identifier.as_ptr(),
                    kind: meta.kind,
                    integer: meta.integer,
                    string: meta.string.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
                })
                .collect();
            let opening = RawScanEvent {
                rule: rule.name.as_ptr(),
                namespace: rule.namespace.as_ptr(),
                tags: tags.as_ptr(),
                tag_count: tags.len(),
                metas: metas.as_ptr(),
                meta_count: metas.len(),
                ..RawScanEvent::empty()
            };

            if !matching {
                if let Some(status) = outcome(callback(ffi::EVENT_RULE_NOT_MATCHING, &opening, user_data)) {
                    return status;
                }
                continue;
            }

            if let Some(status) = outcome(callback(ffi::EVENT_RULE_MATCHING, &opening, user_data)) {
                return status;
            }
            for (string, ranges) in rule.strings.iter().zip(&found) {
                for range in ranges {
                    let event = RawScanEvent {
                        rule: rule.name.as_ptr(),
                        namespace: rule.namespace.as_ptr(),
                        string_id: string.identifier.as_ptr(),
                        offset: range.start as u64,
                        data: data[range.clone()].as_ptr(),
                        data_length: range.len(),
                        string_flags: string.flags,
                        ..RawScanEvent::empty()
                    };
                    if let Some(status) = outcome(callback(ffi::EVENT_STRING_MATCH, &event, user_data)) {
                        return status;
                    }
                }
            }
        }

        match outcome(callback(ffi::EVENT_SCAN_FINISHED, &RawScanEvent::empty(), user_data)) {
            Some(ffi::ERROR_CALLBACK_ERROR) => ffi::ERROR_CALLBACK_ERROR,
            _ => ffi::ERROR_SUCCESS,
        }
    }
}

/// Status that ends the scan for a callback return value, if any.
fn outcome(code: c_int) -> Option<c_int> {
    match code {
        ffi::CALLBACK_CONTINUE => None,
        ffi::CALLBACK_ABORT => Some(ffi::ERROR_SUCCESS),
        _ => Some(ffi::ERROR_CALLBACK_ERROR),
    }
}

pub(super) unsafe extern "C" fn initialize() -> c_int {
    super::INITIALIZE_CALLS.fetch_add(1, Ordering::SeqCst);
    ffi::ERROR_SUCCESS
}

pub(super) unsafe extern "C" fn finalize() -> c_int {
    super::FINALIZE_CALLS.fetch_add(1, Ordering::SeqCst);
    ffi::ERROR_SUCCESS
}

pub(super) unsafe extern "C" fn compiler_create(compiler: *mut *mut RawCompiler) -> c_int {
    if compiler.is_null() {
        return ffi::ERROR_INVALID_ARGUMENT;
    }
    let boxed = Box::new(MockCompiler {
        callback: None,
        user_data: std::ptr::null_mut(),
        sources: Vec::new(),
        rule_names: HashSet::new(),
        externals: Vec::new(),
        errors: 0,
    });
    *compiler = Box::into_raw(boxed).cast();
    LIVE_COMPILERS.fetch_add(1, Ordering::SeqCst);
    ffi::ERROR_SUCCESS
}

pub(super) unsafe extern "C" fn compiler_destroy(compiler: *mut RawCompiler) {
    if !compiler.is_null() {
        drop(Box::from_raw(compiler.cast::<MockCompiler>()));
        LIVE_COMPILERS.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(super) unsafe extern "C" fn compiler_set_callback(
    compiler: *mut RawCompiler,
    callback: Option<CompilerCallback>,
    user_data: *mut c_void,
) {
    if let Some(compiler) = compiler.cast::<MockCompiler>().as_mut() {
        compiler.callback = callback;
        compiler.user_data = user_data;
    }
}

pub(super) unsafe extern "C" fn compiler_add_string(
    compiler: *mut RawCompiler,
    source: *const c_char,
    namespace: *const c_char,
) -> c_int {
    let Some(compiler) = compiler.cast::<MockCompiler>().as_mut() else {
        return 1;
    };
    if source.is_null() {
        compiler.report(
            ffi::DIAGNOSTIC_ERROR,
            &Diagnostic {
                line: 0,
                message: "null source".to_string(),
            },
        );
        compiler.errors += 1;
        return 1;
    }
    let text = CStr::from_ptr(source).to_string_lossy().into_owned();
    let namespace = if namespace.is_null() {
        DEFAULT_NAMESPACE.to_string()
    } else {
        CStr::from_ptr(namespace).to_string_lossy().into_owned()
    };

    let parsed = parser::parse(&text);
    let mut errors = parsed.errors;
    for rule in &parsed.rules {
        if compiler.rule_names.contains(&(namespace.clone(), rule.name.clone())) {
            errors.push(Diagnostic {
                line: rule.line,
                message: format!("duplicated identifier \"{}\"", rule.name),
            });
        }
        if let Condition::External(name) = &rule.condition {
            if !compiler.externals.iter().any(|(n, _)| n == name) {
                errors.push(Diagnostic {
                    line: rule.line,
                    message: format!("undefined identifier \"{name}\""),
                });
            }
        }
        if let Err(message) = compile_rule(&namespace, rule) {
            errors.push(Diagnostic {
                line: rule.line,
                message,
            });
        }
    }
    errors.sort_by_key(|d| d.line);

    for warning in &parsed.warnings {
        compiler.report(ffi::DIAGNOSTIC_WARNING, warning);
    }
    for error in &errors {
        compiler.report(ffi::DIAGNOSTIC_ERROR, error);
    }

    if errors.is_empty() {
        for rule in &parsed.rules {
            compiler.rule_names.insert((namespace.clone(), rule.name.clone()));
        }
        compiler.sources.push(Source { namespace, text });
    }
    compiler.errors += errors.len();
    c_int::try_from(errors.len()).unwrap_or(c_int::MAX)
}

pub(super) unsafe extern "C" fn compiler_define_integer_variable(
    compiler: *mut RawCompiler,
    identifier: *const c_char,
    value: i64,
) -> c_int {
    match compiler.cast::<MockCompiler>().as_mut() {
        Some(compiler) => compiler.define(identifier, External::Integer(value)),
        None => ffi::ERROR_INVALID_ARGUMENT,
    }
}

pub(super) unsafe extern "C" fn compiler_define_boolean_variable(
    compiler: *mut RawCompiler,
    identifier: *const c_char,
    value: c_int,
) -> c_int {
    match compiler.cast::<MockCompiler>().as_mut() {
        Some(compiler) => compiler.define(identifier, External::Boolean(value != 0)),
        None => ffi::ERROR_INVALID_ARGUMENT,
    }
}

pub(super) unsafe extern "C" fn compiler_define_float_variable(
    compiler: *mut RawCompiler,
    identifier: *const c_char,
    value: f64,
) -> c_int {
    match compiler.cast::<MockCompiler>().as_mut() {
        Some(compiler) => compiler.define(identifier, External::Float(value)),
        None => ffi::ERROR_INVALID_ARGUMENT,
    }
}

pub(super) unsafe extern "C" fn compiler_define_string_variable(
    compiler: *mut RawCompiler,
    identifier: *const c_char,
    value: *const c_char,
) -> c_int {
    if value.is_null() {
        return ffi::ERROR_INVALID_ARGUMENT;
    }
    match compiler.cast::<MockCompiler>().as_mut() {
        Some(compiler) => {
            let value = CStr::from_ptr(value).to_bytes().to_vec();
            compiler.define(identifier, External::String(value))
        }
        None => ffi::ERROR_INVALID_ARGUMENT,
    }
}

pub(super) unsafe extern "C" fn compiler_get_rules(
    compiler: *mut RawCompiler,
    rules: *mut *mut RawRules,
) -> c_int {
    let Some(compiler) = compiler.cast::<MockCompiler>().as_ref() else {
        return ffi::ERROR_INVALID_ARGUMENT;
    };
    if rules.is_null() {
        return ffi::ERROR_INVALID_ARGUMENT;
    }
    if compiler.errors > 0 {
        return ffi::ERROR_COMPILER_ERROR;
    }
    match MockRules::build(compiler.sources.clone(), compiler.externals.clone()) {
        Ok(built) => {
            *rules = Box::into_raw(Box::new(built)).cast();
            LIVE_RULES.fetch_add(1, Ordering::SeqCst);
            ffi::ERROR_SUCCESS
        }
        Err(_) => ffi::ERROR_COMPILER_ERROR,
    }
}

pub(super) unsafe extern "C" fn rules_destroy(rules: *mut RawRules) -> c_int {
    if rules.is_null() {
        return ffi::ERROR_INVALID_ARGUMENT;
    }
    drop(Box::from_raw(rules.cast::<MockRules>()));
    LIVE_RULES.fetch_sub(1, Ordering::SeqCst);
    ffi::ERROR_SUCCESS
}

pub(super) unsafe extern "C" fn rules_scan_mem(
    rules: *mut RawRules,
    buffer: *const u8,
    buffer_size: usize,
    flags: c_int,
    callback: ScanCallback,
    user_data: *mut c_void,
    timeout: c_int,
) -> c_int {
    let Some(rules) = rules.cast::<MockRules>().as_ref() else {
        return ffi::ERROR_INVALID_ARGUMENT;
    };
    let data = if buffer.is_null() || buffer_size == 0 {
        &[][..]
    } else {
        std::slice::from_raw_parts(buffer, buffer_size)
    };
    rules.scan(data, flags, callback, user_data, timeout)
}

pub(super) unsafe extern "C" fn rules_scan_file(
    rules: *mut RawRules,
    filename: *const c_char,
    flags: c_int,
    callback: ScanCallback,
    user_data: *mut c_void,
    timeout: c_int,
) -> c_int {
    let Some(rules) = rules.cast::<MockRules>().as_ref() else {
        return ffi::ERROR_INVALID_ARGUMENT;
    };
    if filename.is_null() {
        return ffi::ERROR_INVALID_ARGUMENT;
    }
    let Some(path) = c_path(CStr::from_ptr(filename)) else {
        return ffi::ERROR_COULD_NOT_OPEN_FILE;
    };
    match std::fs::read(path) {
        Ok(data) => rules.scan(&data, flags, callback, user_data, timeout),
        Err(_) => ffi::ERROR_COULD_NOT_OPEN_FILE,
    }
}

#[cfg(unix)]
fn c_path(name: &CStr) -> Option<std::path::PathBuf> {
    use std::os::unix::ffi::OsStrExt;
    Some(std::ffi::OsStr::from_bytes(name.to_bytes()).into())
}

#[cfg(not(unix))]
fn c_path(name: &CStr) -> Option<std::path::PathBuf> {
    name.to_str().ok().map(Into::into)
}

pub(super) unsafe extern "C" fn rules_scan_fd(
    rules: *mut RawRules,
    fd: c_int,
    flags: c_int,
    callback: ScanCallback,
    user_data: *mut c_void,
    timeout: c_int,
) -> c_int {
    let Some(rules) = rules.cast::<MockRules>().as_ref() else {
        return ffi::ERROR_INVALID_ARGUMENT;
    };
    match read_descriptor(fd) {
        Some(data) => rules.scan(&data, flags, callback, user_data, timeout),
        None => ffi::ERROR_COULD_NOT_MAP_FILE,
    }
}

/// Read the whole file behind `fd` without moving its position or closing it.
#[cfg(unix)]
unsafe fn read_descriptor(fd: c_int) -> Option<Vec<u8>> {
    use std::os::unix::fs::FileExt;
    use std::os::unix::io::FromRawFd;

    if fd < 0 {
        return None;
    }
    let file = std::mem::ManuallyDrop::new(std::fs::File::from_raw_fd(fd));
    let mut data = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match file.read_at(&mut chunk, data.len() as u64) {
            Ok(0) => return Some(data),
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(_) => return None,
        }
    }
}

#[cfg(not(unix))]
unsafe fn read_descriptor(_fd: c_int) -> Option<Vec<u8>> {
    None
}

/// Little-endian `u32` prefix for a length or count. Anything the loader
/// would refuse as oversized is refused here too.
fn length_prefix(len: usize) -> Result<[u8; 4], c_int> {
    if len > MAX_SECTION {
        return Err(ffi::ERROR_WRITING_STREAM);
    }
    u32::try_from(len)
        .map(u32::to_le_bytes)
        .map_err(|_| ffi::ERROR_WRITING_STREAM)
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), c_int> {
    out.extend_from_slice(&length_prefix(bytes.len())?);
    out.extend_from_slice(bytes);
    Ok(())
}

fn encode(rules: &MockRules) -> Result<Vec<u8>, c_int> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&length_prefix(rules.sources.len())?);
    for source in &rules.sources {
        put_bytes(&mut out, source.namespace.as_bytes())?;
        put_bytes(&mut out, source.text.as_bytes())?;
    }
    out.extend_from_slice(&length_prefix(rules.externals.len())?);
    for (name, value) in &rules.externals {
        put_bytes(&mut out, name.as_bytes())?;
        match value {
            External::Integer(v) => {
                out.push(0);
                out.extend_from_slice(&v.to_le_bytes());
            }
            External::Boolean(v) => {
                out.push(1);
                out.push(u8::from(*v));
            }
            External::Float(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            External::String(v) => {
                out.push(3);
                put_bytes(&mut out, v)?;
            }
        }
    }
    Ok(out)
}

pub(super) unsafe extern "C" fn rules_save_stream(rules: *mut RawRules, stream: *mut NativeStream) -> c_int {
    let (Some(rules), Some(stream)) = (rules.cast::<MockRules>().as_ref(), stream.as_ref()) else {
        return ffi::ERROR_INVALID_ARGUMENT;
    };
    let Some(write) = stream.write else {
        return ffi::ERROR_INVALID_ARGUMENT;
    };
    let encoded = match encode(rules) {
        Ok(encoded) => encoded,
        Err(status) => return status,
    };
    for chunk in encoded.chunks(WRITE_CHUNK) {
        if write(chunk.as_ptr().cast(), 1, chunk.len(), stream.user_data) != chunk.len() {
            return ffi::ERROR_WRITING_STREAM;
        }
    }
    ffi::ERROR_SUCCESS
}

struct StreamReader<'a> {
    stream: &'a NativeStream,
    read: ffi::StreamReadFn,
}

impl StreamReader<'_> {
    unsafe fn exact(&mut self, len: usize) -> Result<Vec<u8>, c_int> {
        let mut buffer = vec![0u8; len];
        if len > 0 && (self.read)(buffer.as_mut_ptr().cast(), 1, len, self.stream.user_data) != len {
            return Err(ffi::ERROR_CORRUPT_FILE);
        }
        Ok(buffer)
    }

    unsafe fn array<const N: usize>(&mut self) -> Result<[u8; N], c_int> {
        let mut buffer = [0u8; N];
        if (self.read)(buffer.as_mut_ptr().cast(), N, 1, self.stream.user_data) != 1 {
            return Err(ffi::ERROR_CORRUPT_FILE);
        }
        Ok(buffer)
    }

    unsafe fn u32(&mut self) -> Result<u32, c_int> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    unsafe fn bytes(&mut self) -> Result<Vec<u8>, c_int> {
        let len = self.u32()? as usize;
        if len > MAX_SECTION {
            return Err(ffi::ERROR_CORRUPT_FILE);
        }
        self.exact(len)
    }

    unsafe fn text(&mut self) -> Result<String, c_int> {
        String::from_utf8(self.bytes()?).map_err(|_| ffi::ERROR_CORRUPT_FILE)
    }
}

unsafe fn decode(reader: &mut StreamReader<'_>) -> Result<MockRules, c_int> {
    let magic: [u8; 4] = reader.array().map_err(|_| ffi::ERROR_INVALID_FILE)?;
    if &magic != MAGIC {
        return Err(ffi::ERROR_INVALID_FILE);
    }
    if reader.u32()? != FORMAT_VERSION {
        return Err(ffi::ERROR_UNSUPPORTED_FILE_VERSION);
    }

    let source_count = reader.u32()?;
    let mut sources = Vec::new();
    for _ in 0..source_count {
        let namespace = reader.text()?;
        let text = reader.text()?;
        sources.push(Source { namespace, text });
    }

    let external_count = reader.u32()?;
    let mut externals = Vec::new();
    for _ in 0..external_count {
        let name = reader.text()?;
        let [tag] = reader.array::<1>()?;
        let value = match tag {
            0 => External::Integer(i64::from_le_bytes(reader.array()?)),
            1 => External::Boolean(reader.array::<1>()?[0] != 0),
            2 => External::Float(f64::from_bits(u64::from_le_bytes(reader.array()?))),
            3 => External::String(reader.bytes()?),
            _ => return Err(ffi::ERROR_CORRUPT_FILE),
        };
        externals.push((name, value));
    }

    MockRules::build(sources, externals).map_err(|_| ffi::ERROR_CORRUPT_FILE)
}

pub(super) unsafe extern "C" fn rules_load_stream(stream: *mut NativeStream, rules: *mut *mut RawRules) -> c_int {
    let Some(stream) = stream.as_ref() else {
        return ffi::ERROR_INVALID_ARGUMENT;
    };
    let Some(read) = stream.read else {
        return ffi::ERROR_INVALID_ARGUMENT;
    };
    if rules.is_null() {
        return ffi::ERROR_INVALID_ARGUMENT;
    }
    match decode(&mut StreamReader { stream, read }) {
        Ok(loaded) => {
            *rules = Box::into_raw(Box::new(loaded)).cast();
            LIVE_RULES.fetch_add(1, Ordering::SeqCst);
            ffi::ERROR_SUCCESS
        }
        Err(status) => status,
    }
}
