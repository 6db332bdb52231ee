//! Compiler diagnostics, external variables and namespaces.

use rulebridge::{mock, BridgeError, Compiler, ExternalValue, Rules, ScanConfig, Severity};

#[test]
fn test_errors_carry_lines_and_messages() {
    let mut compiler = Compiler::new(&mock::engine()).unwrap();
    let source = "\
rule dup { condition: true }
rule dup { condition: true }

rule empty { strings: $a = \"\" condition: $a }
rule lonely { condition: any of them }
";
    let err = compiler.add_string(source, None).unwrap_err();
    let diagnostics = err.diagnostics();
    let lines: Vec<u32> = diagnostics.iter().map(|d| d.line).collect();
    assert_eq!(lines, vec![2, 4, 5]);
    assert!(diagnostics[0].message.contains("dup"));
    assert!(diagnostics[2].message.contains("them"));
    assert!(err.to_string().contains("dup"));
}

#[test]
fn test_errors_across_multiple_rules() {
    let mut compiler = Compiler::new(&mock::engine()).unwrap();
    let err = compiler
        .add_string(
            "rule a { strings: $x = \"x\" condition: $z }\nrule b {",
            Some("broken"),
        )
        .unwrap_err();
    assert_eq!(err.diagnostics().len(), 2);
    assert!(err.diagnostics().iter().all(|d| d.severity == Severity::Error));
}

#[test]
fn test_duplicate_rule_across_sources_in_namespace() {
    let mut compiler = Compiler::new(&mock::engine()).unwrap();
    compiler.add_string("rule once { condition: true }", Some("ns")).unwrap();
    assert!(compiler.add_string("rule once { condition: true }", Some("ns")).is_err());

    let mut compiler = Compiler::new(&mock::engine()).unwrap();
    compiler.add_string("rule once { condition: true }", Some("a")).unwrap();
    compiler.add_string("rule once { condition: true }", Some("b")).unwrap();
    let rules = compiler.into_rules().unwrap();
    let matches = rules.scan_mem(b"", &ScanConfig::default()).unwrap();
    let namespaces: Vec<_> = matches.iter().map(|m| m.namespace.as_str()).collect();
    assert_eq!(namespaces, vec!["a", "b"]);
    rules.release();
}

#[test]
fn test_external_variables_of_every_kind() {
    let mut compiler = Compiler::new(&mock::engine()).unwrap();
    compiler.define_variable("count", 3i64).unwrap();
    compiler.define_variable("zero", 0i64).unwrap();
    compiler.define_variable("flag", true).unwrap();
    compiler.define_variable("off", false).unwrap();
    compiler.define_variable("ratio", 0.5).unwrap();
    compiler.define_variable("name", "sample.exe").unwrap();
    compiler.define_variable("blank", ExternalValue::String(String::new())).unwrap();
    compiler
        .add_string(
            r#"
rule by_count { condition: count }
rule by_zero { condition: zero }
rule by_flag { condition: flag }
rule by_off { condition: off }
rule by_ratio { condition: ratio }
rule by_name { condition: name }
rule by_blank { condition: blank }
"#,
            None,
        )
        .unwrap();
    let rules = compiler.into_rules().unwrap();

    let matched: Vec<_> = rules
        .scan_mem(b"", &ScanConfig::default())
        .unwrap()
        .into_iter()
        .map(|m| m.rule)
        .collect();
    assert_eq!(matched, vec!["by_count", "by_flag", "by_ratio", "by_name"]);
    rules.release();
}

#[test]
fn test_undefined_external_is_an_error() {
    let mut compiler = Compiler::new(&mock::engine()).unwrap();
    let err = compiler
        .add_string("rule gated { condition: undefined_switch }", None)
        .unwrap_err();
    assert!(err.diagnostics()[0].message.contains("undefined_switch"));
}

#[test]
fn test_warnings_survive_into_rules() {
    let mut compiler = Compiler::new(&mock::engine()).unwrap();
    compiler
        .add_string(
            r#"rule noisy { strings: $a = "a" $b = "b" condition: $a }"#,
            None,
        )
        .unwrap();
    assert_eq!(compiler.warnings().len(), 1);
    assert_eq!(compiler.diagnostics().len(), 1);
    let rules = compiler.into_rules().unwrap();
    assert_eq!(rules.scan_mem(b"a", &ScanConfig::default()).unwrap().len(), 1);
    rules.release();
}

#[test]
fn test_compile_shortcut_reports_errors() {
    let err = Rules::compile(&mock::engine(), "rule {", None).unwrap_err();
    assert!(matches!(err, BridgeError::Compilation(ref d) if !d.is_empty()));
    assert!(!err.is_internal());
}
