//! Callback bridge between the native engine and per-call contexts.
//!
//! The engine reports scan events and compiler diagnostics through plain C
//! function pointers. The functions here are those pointers: each resolves
//! the `user_data` token through the registry, decodes the native record into
//! owned values and appends them to the context. Nothing engine-owned is
//! retained past the return of a callback.

use crate::config::{CancellationToken, ScanConfig};
use crate::error::{BridgeError, CompileDiagnostic, Result, Severity};
use crate::ffi::{self, RawMeta, RawScanEvent};
use crate::matches::{MatchRule, MatchString, Meta, MetaValue, RuleStatus, StringFlags};
use crate::registry::{self, Context, ContextKind, Token};
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};

/// Accumulator for one scan invocation.
pub(crate) struct ScanContext {
    rules: Vec<MatchRule>,
    first_match_only: bool,
    cancellation: Option<CancellationToken>,
    cancelled: bool,
    failure: Option<BridgeError>,
    events: usize,
}

impl Context for ScanContext {
    const KIND: ContextKind = ContextKind::Scan;
}

impl ScanContext {
    pub(crate) fn new(config: &ScanConfig) -> Self {
        Self {
            rules: Vec::new(),
            first_match_only: config.first_match_only,
            cancellation: config.cancellation.clone(),
            cancelled: false,
            failure: None,
            events: 0,
        }
    }

    /// Guards [`ScanContext::handle_event`] so a panic is recorded instead of
    /// unwinding into the engine.
    fn dispatch(&mut self, message: c_int, event: &RawScanEvent) -> c_int {
        match panic::catch_unwind(AssertUnwindSafe(|| self.handle_event(message, event))) {
            Ok(code) => code,
            Err(_) => {
                tracing::error!(message, "panic while decoding scan event");
                self.failure = Some(BridgeError::Engine(ffi::ERROR_CALLBACK_ERROR));
                ffi::CALLBACK_ERROR
            }
        }
    }

    fn handle_event(&mut self, message: c_int, event: &RawScanEvent) -> c_int {
        self.events += 1;
        if self
            .cancellation
            .as_ref()
            .map_or(false, CancellationToken::is_cancelled)
        {
            self.cancelled = true;
            return ffi::CALLBACK_ABORT;
        }

        // Once a matching rule is held, only its own string matches are kept.
        let settled = self.first_match_only && self.rules.iter().any(MatchRule::is_matching);

        match message {
            ffi::EVENT_RULE_MATCHING | ffi::EVENT_RULE_NOT_MATCHING if settled => {
                return ffi::CALLBACK_ABORT;
            }
            ffi::EVENT_RULE_MATCHING => {
                self.rules
                    .push(unsafe { decode_rule(event, RuleStatus::Matching) });
            }
            ffi::EVENT_RULE_NOT_MATCHING => {
                self.rules
                    .push(unsafe { decode_rule(event, RuleStatus::NotMatching) });
            }
            ffi::EVENT_STRING_MATCH => {
                let rule = unsafe { c_string(event.rule) };
                let namespace = unsafe { c_string(event.namespace) };
                let string = unsafe { decode_string(event) };
                let open = self
                    .rules
                    .iter_mut()
                    .rev()
                    .find(|r| r.is_matching() && r.is_same_rule(&rule, &namespace));
                match open {
                    Some(open) => open.strings.push(string),
                    None if settled => return ffi::CALLBACK_ABORT,
                    None => {
                        let mut opened = MatchRule::new(rule, namespace, RuleStatus::Matching);
                        opened.strings.push(string);
                        self.rules.push(opened);
                    }
                }
            }
            ffi::EVENT_SCAN_FINISHED => {}
            other => tracing::trace!(message = other, "ignoring unknown scan message"),
        }
        ffi::CALLBACK_CONTINUE
    }

    /// Combine the native status with what the callbacks observed.
    pub(crate) fn finish(mut self, status: c_int, token: Token) -> Result<Vec<MatchRule>> {
        if let Some(failure) = self.failure.take() {
            return Err(failure);
        }
        if self.cancelled {
            return Err(BridgeError::ScanCancelled);
        }
        match status {
            ffi::ERROR_SUCCESS => {
                tracing::debug!(
                    token,
                    events = self.events,
                    rules = self.rules.len(),
                    "scan finished"
                );
                Ok(self.rules)
            }
            // The bridge only reports an error when the token did not resolve.
            ffi::ERROR_CALLBACK_ERROR => Err(BridgeError::UnknownToken(token)),
            other => Err(BridgeError::from_status(other).unwrap_or(BridgeError::Engine(other))),
        }
    }
}

/// Diagnostics collected for one compiler over its whole lifetime.
#[derive(Default)]
pub(crate) struct CompileContext {
    diagnostics: Vec<CompileDiagnostic>,
    /// Attributed to diagnostics that arrive without a file name.
    pub(crate) current_file: Option<String>,
}

impl Context for CompileContext {
    const KIND: ContextKind = ContextKind::Compile;
}

impl CompileContext {
    pub(crate) fn diagnostics(&self) -> &[CompileDiagnostic] {
        &self.diagnostics
    }

    fn push(&mut self, level: c_int, file: Option<String>, line: c_int, message: String) {
        self.diagnostics.push(CompileDiagnostic {
            severity: Severity::from_level(level),
            file: file.or_else(|| self.current_file.clone()),
            line: u32::try_from(line).unwrap_or(0),
            message,
        });
    }
}

/// Scan event sink handed to `rules_scan_*`.
pub(crate) unsafe extern "C" fn scan_callback(
    message: c_int,
    event: *const RawScanEvent,
    user_data: *mut c_void,
) -> c_int {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let context = unsafe { registry::resolve::<ScanContext>(user_data) }?;
        let empty = RawScanEvent::empty();
        let event = unsafe { event.as_ref() }.unwrap_or(&empty);
        Ok::<_, BridgeError>(context.dispatch(message, event))
    }));

    match outcome {
        Ok(Ok(code)) => code,
        Ok(Err(err)) => {
            tracing::error!(error = %err, message, "scan callback for unregistered context");
            registry::note_unresolved(user_data as Token);
            ffi::CALLBACK_ERROR
        }
        Err(_) => {
            tracing::error!(message, "panic in scan callback");
            ffi::CALLBACK_ERROR
        }
    }
}

/// Diagnostic sink installed with `compiler_set_callback`.
pub(crate) unsafe extern "C" fn compiler_callback(
    level: c_int,
    file_name: *const c_char,
    line: c_int,
    message: *const c_char,
    user_data: *mut c_void,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let context = unsafe { registry::resolve::<CompileContext>(user_data) }?;
        let file = (!file_name.is_null()).then(|| unsafe { c_string(file_name) });
        context.push(level, file, line, unsafe { c_string(message) });
        Ok::<_, BridgeError>(())
    }));

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::error!(error = %err, line, "compiler diagnostic for unregistered context");
            registry::note_unresolved(user_data as Token);
        }
        Err(_) => tracing::error!(line, "panic in compiler callback"),
    }
}

unsafe fn c_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

unsafe fn raw_slice<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, len)
    }
}

unsafe fn decode_meta(meta: &RawMeta) -> Option<Meta> {
    let value = match meta.kind {
        ffi::META_TYPE_INTEGER => MetaValue::Integer(meta.integer),
        ffi::META_TYPE_STRING => MetaValue::String(c_string(meta.string)),
        ffi::META_TYPE_BOOLEAN => MetaValue::Boolean(meta.integer != 0),
        other => {
            tracing::trace!(kind = other, "skipping metadata of unknown kind");
            return None;
        }
    };
    Some(Meta {
        identifier: c_string(meta.identifier),
        value,
    })
}

unsafe fn decode_rule(event: &RawScanEvent, status: RuleStatus) -> MatchRule {
    let mut rule = MatchRule::new(c_string(event.rule), c_string(event.namespace), status);
    rule.tags = raw_slice(event.tags, event.tag_count)
        .iter()
        .map(|tag| c_string(*tag))
        .collect();
    rule.metas = raw_slice(event.metas, event.meta_count)
        .iter()
        .filter_map(|meta| decode_meta(meta))
        .collect();
    rule
}

unsafe fn decode_string(event: &RawScanEvent) -> MatchString {
    MatchString {
        name: c_string(event.string_id),
        offset: event.offset,
        data: raw_slice(event.data, event.data_length).to_vec(),
        flags: StringFlags::from_bits(event.string_flags),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registered;
    use std::ffi::CString;

    struct EventStrings {
        rule: CString,
        namespace: CString,
        string_id: CString,
    }

    impl EventStrings {
        fn new(rule: &str, string_id: &str) -> Self {
            Self {
                rule: CString::new(rule).unwrap(),
                namespace: CString::new("default").unwrap(),
                string_id: CString::new(string_id).unwrap(),
            }
        }

        fn rule_event(&self) -> RawScanEvent {
            RawScanEvent {
                rule: self.rule.as_ptr(),
                namespace: self.namespace.as_ptr(),
                ..RawScanEvent::empty()
            }
        }

        fn string_event(&self, offset: u64, data: &[u8]) -> RawScanEvent {
            RawScanEvent {
                string_id: self.string_id.as_ptr(),
                offset,
                data: data.as_ptr(),
                data_length: data.len(),
                string_flags: ffi::STRING_FLAGS_ASCII,
                ..self.rule_event()
            }
        }
    }

    fn send(context: &Registered<ScanContext>, message: c_int, event: &RawScanEvent) -> c_int {
        unsafe { scan_callback(message, event, context.user_data()) }
    }

    fn finish(context: Registered<ScanContext>, status: c_int) -> Result<Vec<MatchRule>> {
        let token = context.token();
        context.into_inner().finish(status, token)
    }

    #[test]
    fn test_rule_with_strings_tags_and_metas() {
        let strings = EventStrings::new("test", "$a");
        let tag = CString::new("tag1").unwrap();
        let tags = [tag.as_ptr()];
        let author = CString::new("author").unwrap();
        let author_value = CString::new("Hilko Bengen").unwrap();
        let score = CString::new("score").unwrap();
        let metas = [
            RawMeta {
                identifier: author.as_ptr(),
                kind: ffi::META_TYPE_STRING,
                integer: 0,
                string: author_value.as_ptr(),
            },
            RawMeta {
                identifier: score.as_ptr(),
                kind: ffi::META_TYPE_INTEGER,
                integer: 80,
                string: std::ptr::null(),
            },
        ];

        let context = Registered::new(ScanContext::new(&ScanConfig::default()));
        let opening = RawScanEvent {
            tags: tags.as_ptr(),
            tag_count: tags.len(),
            metas: metas.as_ptr(),
            meta_count: metas.len(),
            ..strings.rule_event()
        };
        assert_eq!(send(&context, ffi::EVENT_RULE_MATCHING, &opening), ffi::CALLBACK_CONTINUE);

        let mut data = b"abc".to_vec();
        let event = strings.string_event(1, &data);
        assert_eq!(send(&context, ffi::EVENT_STRING_MATCH, &event), ffi::CALLBACK_CONTINUE);
        // The bridge must own its copy once the callback returns.
        data.copy_from_slice(b"zzz");
        send(&context, ffi::EVENT_SCAN_FINISHED, &RawScanEvent::empty());

        let rules = finish(context, ffi::ERROR_SUCCESS).unwrap();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.rule, "test");
        assert_eq!(rule.namespace, "default");
        assert_eq!(rule.tags, vec!["tag1".to_string()]);
        assert_eq!(rule.meta("author"), Some(&MetaValue::String("Hilko Bengen".to_string())));
        assert_eq!(rule.meta("score"), Some(&MetaValue::Integer(80)));
        assert_eq!(rule.strings.len(), 1);
        assert_eq!(rule.strings[0].name, "$a");
        assert_eq!(rule.strings[0].offset, 1);
        assert_eq!(rule.strings[0].data, b"abc");
        assert!(rule.strings[0].flags.ascii());
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        let context = Registered::new(ScanContext::new(&ScanConfig::default()));
        let code = unsafe { scan_callback(ffi::EVENT_RULE_MATCHING, std::ptr::null(), context.user_data()) };
        assert_eq!(code, ffi::CALLBACK_CONTINUE);
        send(&context, ffi::EVENT_STRING_MATCH, &RawScanEvent::empty());

        let rules = finish(context, ffi::ERROR_SUCCESS).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule, "");
        assert!(rules[0].tags.is_empty());
        assert_eq!(rules[0].strings[0].data, Vec::<u8>::new());
        assert_eq!(rules[0].strings[0].offset, 0);
    }

    #[test]
    fn test_string_match_without_open_rule_opens_one() {
        let strings = EventStrings::new("orphan", "$x");
        let context = Registered::new(ScanContext::new(&ScanConfig::default()));
        send(&context, ffi::EVENT_STRING_MATCH, &strings.string_event(4, b"xy"));
        send(&context, ffi::EVENT_STRING_MATCH, &strings.string_event(9, b"xy"));

        let rules = finish(context, ffi::ERROR_SUCCESS).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule, "orphan");
        assert_eq!(rules[0].strings.len(), 2);
    }

    #[test]
    fn test_non_matching_rules_are_reported_with_status() {
        let first = EventStrings::new("hit", "$a");
        let second = EventStrings::new("miss", "$a");
        let context = Registered::new(ScanContext::new(&ScanConfig::default()));
        send(&context, ffi::EVENT_RULE_MATCHING, &first.rule_event());
        send(&context, ffi::EVENT_RULE_NOT_MATCHING, &second.rule_event());

        let rules = finish(context, ffi::ERROR_SUCCESS).unwrap();
        assert_eq!(rules[0].status, RuleStatus::Matching);
        assert_eq!(rules[1].status, RuleStatus::NotMatching);
        assert_eq!(rules[1].rule, "miss");
    }

    #[test]
    fn test_first_match_only_aborts_on_second_rule() {
        let first = EventStrings::new("one", "$a");
        let second = EventStrings::new("two", "$a");
        let config = ScanConfig::default().with_first_match_only(true);
        let context = Registered::new(ScanContext::new(&config));

        assert_eq!(send(&context, ffi::EVENT_RULE_MATCHING, &first.rule_event()), ffi::CALLBACK_CONTINUE);
        assert_eq!(
            send(&context, ffi::EVENT_STRING_MATCH, &first.string_event(0, b"a")),
            ffi::CALLBACK_CONTINUE
        );
        assert_eq!(send(&context, ffi::EVENT_RULE_MATCHING, &second.rule_event()), ffi::CALLBACK_ABORT);

        let rules = finish(context, ffi::ERROR_SUCCESS).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule, "one");
        assert_eq!(rules[0].strings.len(), 1);
    }

    #[test]
    fn test_first_match_only_drops_later_non_matching_rules() {
        let hit = EventStrings::new("hit", "$a");
        let miss = EventStrings::new("miss", "$a");
        let stray = EventStrings::new("stray", "$b");
        let config = ScanConfig::default()
            .with_first_match_only(true)
            .with_report_non_matching(true);
        let context = Registered::new(ScanContext::new(&config));

        assert_eq!(send(&context, ffi::EVENT_RULE_NOT_MATCHING, &miss.rule_event()), ffi::CALLBACK_CONTINUE);
        assert_eq!(send(&context, ffi::EVENT_RULE_MATCHING, &hit.rule_event()), ffi::CALLBACK_CONTINUE);
        assert_eq!(
            send(&context, ffi::EVENT_STRING_MATCH, &hit.string_event(2, b"a")),
            ffi::CALLBACK_CONTINUE
        );
        assert_eq!(send(&context, ffi::EVENT_RULE_NOT_MATCHING, &miss.rule_event()), ffi::CALLBACK_ABORT);
        assert_eq!(
            send(&context, ffi::EVENT_STRING_MATCH, &stray.string_event(0, b"b")),
            ffi::CALLBACK_ABORT
        );

        let rules = finish(context, ffi::ERROR_SUCCESS).unwrap();
        let seen: Vec<_> = rules.iter().map(|r| (r.rule.as_str(), r.status)).collect();
        assert_eq!(
            seen,
            vec![("miss", RuleStatus::NotMatching), ("hit", RuleStatus::Matching)]
        );
        assert_eq!(rules[1].strings.len(), 1);
    }

    #[test]
    fn test_cancellation_aborts_and_reports_cancelled() {
        let strings = EventStrings::new("test", "$a");
        let cancellation = CancellationToken::new();
        let config = ScanConfig::default().with_cancellation(cancellation.clone());
        let context = Registered::new(ScanContext::new(&config));

        assert_eq!(send(&context, ffi::EVENT_RULE_MATCHING, &strings.rule_event()), ffi::CALLBACK_CONTINUE);
        cancellation.cancel();
        assert_eq!(
            send(&context, ffi::EVENT_STRING_MATCH, &strings.string_event(0, b"a")),
            ffi::CALLBACK_ABORT
        );

        assert_eq!(finish(context, ffi::ERROR_SUCCESS).unwrap_err(), BridgeError::ScanCancelled);
    }

    #[test]
    fn test_unknown_token_returns_callback_error() {
        let context = Registered::new(ScanContext::new(&ScanConfig::default()));
        let stale = context.user_data();
        drop(context);

        let (code, unresolved) = registry::watch_unresolved(|| unsafe {
            scan_callback(ffi::EVENT_RULE_MATCHING, std::ptr::null(), stale)
        });
        assert_eq!(code, ffi::CALLBACK_ERROR);
        assert_eq!(unresolved, Some(stale as Token));
    }

    #[test]
    fn test_compiler_callback_records_unknown_token() {
        let message = CString::new("unused").unwrap();
        let context = Registered::new(CompileContext::default());
        let stale = context.user_data();
        drop(context);

        let ((), unresolved) = registry::watch_unresolved(|| unsafe {
            compiler_callback(ffi::DIAGNOSTIC_ERROR, std::ptr::null(), 1, message.as_ptr(), stale)
        });
        assert_eq!(unresolved, Some(stale as Token));
    }

    #[test]
    fn test_finish_translates_native_status() {
        let context = Registered::new(ScanContext::new(&ScanConfig::default()));
        let token = context.token();
        assert_eq!(
            finish(context, ffi::ERROR_CALLBACK_ERROR).unwrap_err(),
            BridgeError::UnknownToken(token)
        );

        let context = Registered::new(ScanContext::new(&ScanConfig::default()));
        assert_eq!(finish(context, ffi::ERROR_SCAN_TIMEOUT).unwrap_err(), BridgeError::ScanTimedOut);

        let context = Registered::new(ScanContext::new(&ScanConfig::default()));
        assert!(finish(context, ffi::ERROR_SUCCESS).unwrap().is_empty());
    }

    #[test]
    fn test_compiler_callback_collects_diagnostics() {
        let message = CString::new("syntax error, unexpected identifier").unwrap();
        let file = CString::new("base.yar").unwrap();
        let mut context = Registered::new(CompileContext::default());
        context.get_mut().current_file = Some("fallback.yar".to_string());

        unsafe {
            compiler_callback(ffi::DIAGNOSTIC_ERROR, std::ptr::null(), 3, message.as_ptr(), context.user_data());
            compiler_callback(ffi::DIAGNOSTIC_WARNING, file.as_ptr(), 7, message.as_ptr(), context.user_data());
            compiler_callback(ffi::DIAGNOSTIC_ERROR, std::ptr::null(), -1, std::ptr::null(), context.user_data());
        }

        let diagnostics = context.get().diagnostics();
        assert_eq!(diagnostics.len(), 3);
        assert_eq!(diagnostics[0].severity, Severity::Error);
        assert_eq!(diagnostics[0].line, 3);
        assert_eq!(diagnostics[0].file.as_deref(), Some("fallback.yar"));
        assert_eq!(diagnostics[1].severity, Severity::Warning);
        assert_eq!(diagnostics[1].file.as_deref(), Some("base.yar"));
        assert_eq!(diagnostics[2].line, 0);
        assert_eq!(diagnostics[2].message, "");
    }
}
