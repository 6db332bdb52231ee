//! Match data returned by a scan.
//!
//! A scan yields one [`MatchRule`] per reported rule, in the order the engine
//! reported them. Each matching rule carries the [`MatchString`] records of
//! its pattern occurrences: pattern declaration order, then ascending offset.
//! All data is owned; nothing refers back into engine memory.

use crate::ffi;
use serde::{Serialize, Serializer};
use std::fmt;

/// Whether a reported rule evaluated true or false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Matching,
    /// Only reported when [`crate::ScanConfig::report_non_matching`] is set.
    NotMatching,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetaValue {
    Integer(i64),
    String(String),
    Boolean(bool),
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Integer(value) => write!(f, "{value}"),
            MetaValue::String(value) => write!(f, "{value:?}"),
            MetaValue::Boolean(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Meta {
    pub identifier: String,
    pub value: MetaValue,
}

/// Pattern modifiers reported with a string match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct StringFlags(u32);

impl StringFlags {
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn nocase(self) -> bool {
        self.0 & ffi::STRING_FLAGS_NOCASE != 0
    }

    pub const fn wide(self) -> bool {
        self.0 & ffi::STRING_FLAGS_WIDE != 0
    }

    pub const fn ascii(self) -> bool {
        self.0 & ffi::STRING_FLAGS_ASCII != 0
    }

    pub const fn fullword(self) -> bool {
        self.0 & ffi::STRING_FLAGS_FULLWORD != 0
    }

    pub const fn is_hex(self) -> bool {
        self.0 & ffi::STRING_FLAGS_HEX != 0
    }

    pub const fn is_regexp(self) -> bool {
        self.0 & ffi::STRING_FLAGS_REGEXP != 0
    }
}

/// One occurrence of a pattern in the scanned data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchString {
    /// Pattern identifier, e.g. `$a`. Empty when the engine did not report one.
    pub name: String,
    pub offset: u64,
    #[serde(serialize_with = "serialize_base64")]
    pub data: Vec<u8>,
    pub flags: StringFlags,
}

impl MatchString {
    /// Byte range of the occurrence within the scanned data.
    pub fn span(&self) -> std::ops::Range<u64> {
        self.offset..self.offset + self.data.len() as u64
    }
}

/// A rule reported by the engine together with its string matches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchRule {
    pub rule: String,
    pub namespace: String,
    pub tags: Vec<String>,
    pub metas: Vec<Meta>,
    pub strings: Vec<MatchString>,
    pub status: RuleStatus,
}

impl MatchRule {
    pub(crate) fn new(rule: String, namespace: String, status: RuleStatus) -> Self {
        Self {
            rule,
            namespace,
            tags: Vec::new(),
            metas: Vec::new(),
            strings: Vec::new(),
            status,
        }
    }

    pub fn is_matching(&self) -> bool {
        self.status == RuleStatus::Matching
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// First metadata value declared under `identifier`.
    pub fn meta(&self, identifier: &str) -> Option<&MetaValue> {
        self.metas
            .iter()
            .find(|meta| meta.identifier == identifier)
            .map(|meta| &meta.value)
    }

    /// Occurrences of the pattern named `name`.
    pub fn matches_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MatchString> + 'a {
        self.strings.iter().filter(move |s| s.name == name)
    }

    pub(crate) fn is_same_rule(&self, rule: &str, namespace: &str) -> bool {
        self.rule == rule && self.namespace == namespace
    }
}

fn serialize_base64<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    use base64::Engine as _;
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rule() -> MatchRule {
        let mut rule = MatchRule::new("test".to_string(), "default".to_string(), RuleStatus::Matching);
        rule.tags = vec!["tag1".to_string()];
        rule.metas = vec![
            Meta {
                identifier: "author".to_string(),
                value: MetaValue::String("Hilko Bengen".to_string()),
            },
            Meta {
                identifier: "score".to_string(),
                value: MetaValue::Integer(80),
            },
        ];
        rule.strings = vec![
            MatchString {
                name: "$a".to_string(),
                offset: 1,
                data: b"abc".to_vec(),
                flags: StringFlags::from_bits(ffi::STRING_FLAGS_FULLWORD | ffi::STRING_FLAGS_ASCII),
            },
            MatchString {
                name: "$b".to_string(),
                offset: 9,
                data: b"xyz".to_vec(),
                flags: StringFlags::default(),
            },
        ];
        rule
    }

    #[test]
    fn test_accessors() {
        let rule = sample_rule();
        assert!(rule.is_matching());
        assert!(rule.has_tag("tag1"));
        assert!(!rule.has_tag("tag2"));
        assert_eq!(rule.meta("score"), Some(&MetaValue::Integer(80)));
        assert_eq!(rule.meta("missing"), None);
        assert_eq!(rule.matches_of("$a").count(), 1);
        assert_eq!(rule.matches_of("$c").count(), 0);
        assert!(rule.is_same_rule("test", "default"));
        assert!(!rule.is_same_rule("test", "other"));
    }

    #[test]
    fn test_string_flags() {
        let flags = StringFlags::from_bits(ffi::STRING_FLAGS_NOCASE | ffi::STRING_FLAGS_WIDE);
        assert!(flags.nocase());
        assert!(flags.wide());
        assert!(!flags.ascii());
        assert!(!flags.fullword());
        assert!(!flags.is_hex());
        assert!(!flags.is_regexp());
        assert_eq!(flags.bits(), 3);
    }

    #[test]
    fn test_span() {
        let rule = sample_rule();
        assert_eq!(rule.strings[0].span(), 1..4);
    }

    #[test]
    fn test_json_serialization_encodes_data_as_base64() {
        let value = serde_json::to_value(sample_rule()).unwrap();
        assert_eq!(value["rule"], "test");
        assert_eq!(value["status"], "matching");
        assert_eq!(value["strings"][0]["data"], "YWJj");
        assert_eq!(value["strings"][0]["flags"], 12);
        assert_eq!(value["metas"][0]["value"], "Hilko Bengen");
        assert_eq!(value["metas"][1]["value"], 80);
    }

    #[test]
    fn test_meta_value_display() {
        assert_eq!(MetaValue::Integer(-3).to_string(), "-3");
        assert_eq!(MetaValue::String("a".to_string()).to_string(), "\"a\"");
        assert_eq!(MetaValue::Boolean(true).to_string(), "true");
    }
}
