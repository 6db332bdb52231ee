//! Parser for the literal-only rule subset understood by the mock engine.
//!
//! ```text
//! rule NAME [: TAG ...] {
//!     meta:      ID = "text" | INT | true | false ...
//!     strings:   $ID = "literal" [nocase] [wide] [ascii] [fullword] ...
//!     condition: true | false | any of them | all of them | $ID
//!                | filesize == INT | EXTERNAL
//! }
//! ```
//!
//! Errors are collected per rule; after an error the parser skips to the next
//! `rule` keyword so one source reports every broken rule.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MetaLiteral {
    Integer(i64),
    String(Vec<u8>),
    Boolean(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MetaDef {
    pub identifier: String,
    pub value: MetaLiteral,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct StringDef {
    pub identifier: String,
    pub literal: Vec<u8>,
    pub nocase: bool,
    pub wide: bool,
    pub ascii: bool,
    pub fullword: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Condition {
    Constant(bool),
    AnyOfThem,
    AllOfThem,
    /// Index into the rule's strings.
    String(usize),
    FilesizeEq(u64),
    External(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RuleDef {
    pub name: String,
    pub line: u32,
    pub tags: Vec<String>,
    pub metas: Vec<MetaDef>,
    pub strings: Vec<StringDef>,
    pub condition: Condition,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Diagnostic {
    pub line: u32,
    pub message: String,
}

#[derive(Debug, Default)]
pub(crate) struct Parsed {
    pub rules: Vec<RuleDef>,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    StringId(String),
    Text(Vec<u8>),
    Int(i64),
    Punct(&'static str),
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Ident(name) => format!("identifier \"{name}\""),
            Tok::StringId(id) => format!("string identifier \"{id}\""),
            Tok::Text(_) => "text string".to_string(),
            Tok::Int(value) => format!("integer {value}"),
            Tok::Punct(p) => format!("\"{p}\""),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: u32,
}

fn token_pattern() -> Result<&'static Regex, &'static regex::Error> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r#"(?x) \A (?:
              (?P<ws>[\ \t\r\n]+)
            | (?P<comment>//[^\n]*|/\*(?s:.*?)\*/)
            | (?P<text>"(?:[^"\\\n]|\\.)*")
            | (?P<sid>\$[A-Za-z0-9_]*)
            | (?P<hex>0x[0-9A-Fa-f]+)
            | (?P<int>-?[0-9]+)
            | (?P<ident>[A-Za-z_][A-Za-z0-9_]*)
            | (?P<punct>==|[{}:=])
            )"#,
            )
        })
        .as_ref()
}

fn unescape(body: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(body.len());
    let mut bytes = body.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b't') => out.push(b'\t'),
            Some(b'r') => out.push(b'\r'),
            Some(b'"') => out.push(b'"'),
            Some(b'\\') => out.push(b'\\'),
            Some(b'x') => {
                let hi = bytes.next().and_then(|c| (c as char).to_digit(16));
                let lo = bytes.next().and_then(|c| (c as char).to_digit(16));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push((hi * 16 + lo) as u8),
                    _ => return Err("invalid hex escape sequence".to_string()),
                }
            }
            Some(other) => return Err(format!("invalid escape sequence \"\\{}\"", other as char)),
            None => return Err("unterminated escape sequence".to_string()),
        }
    }
    Ok(out)
}

fn tokenize(source: &str, errors: &mut Vec<Diagnostic>) -> Vec<Token> {
    let mut tokens = Vec::new();
    let pattern = match token_pattern() {
        Ok(pattern) => pattern,
        Err(e) => {
            errors.push(Diagnostic {
                line: 0,
                message: format!("tokenizer unavailable: {e}"),
            });
            return tokens;
        }
    };
    let mut line = 1u32;
    let mut pos = 0;

    while pos < source.len() {
        let rest = &source[pos..];
        let Some(caps) = pattern.captures(rest) else {
            let bad = rest.chars().next().unwrap_or(' ');
            errors.push(Diagnostic {
                line,
                message: format!("unexpected character \"{bad}\""),
            });
            pos += bad.len_utf8();
            continue;
        };
        let whole = caps.get(0).map_or("", |m| m.as_str());
        let start_line = line;
        line += whole.matches('\n').count() as u32;
        pos += whole.len().max(1);

        let tok = if caps.name("ws").is_some() || caps.name("comment").is_some() {
            continue;
        } else if let Some(text) = caps.name("text") {
            let body = &text.as_str()[1..text.as_str().len() - 1];
            match unescape(body) {
                Ok(bytes) => Tok::Text(bytes),
                Err(message) => {
                    errors.push(Diagnostic { line: start_line, message });
                    Tok::Text(body.as_bytes().to_vec())
                }
            }
        } else if let Some(sid) = caps.name("sid") {
            Tok::StringId(sid.as_str().to_string())
        } else if let Some(hex) = caps.name("hex") {
            match i64::from_str_radix(&hex.as_str()[2..], 16) {
                Ok(value) => Tok::Int(value),
                Err(_) => {
                    errors.push(Diagnostic {
                        line: start_line,
                        message: format!("integer out of range: {}", hex.as_str()),
                    });
                    Tok::Int(0)
                }
            }
        } else if let Some(int) = caps.name("int") {
            match int.as_str().parse() {
                Ok(value) => Tok::Int(value),
                Err(_) => {
                    errors.push(Diagnostic {
                        line: start_line,
                        message: format!("integer out of range: {}", int.as_str()),
                    });
                    Tok::Int(0)
                }
            }
        } else if let Some(ident) = caps.name("ident") {
            Tok::Ident(ident.as_str().to_string())
        } else {
            match whole {
                "==" => Tok::Punct("=="),
                "{" => Tok::Punct("{"),
                "}" => Tok::Punct("}"),
                ":" => Tok::Punct(":"),
                _ => Tok::Punct("="),
            }
        };
        tokens.push(Token { tok, line: start_line });
    }
    tokens
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    last_line: u32,
}

type Step<T> = Result<T, Diagnostic>;

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn peek_at(&self, offset: usize) -> Option<&'a Tok> {
        self.tokens.get(self.pos + offset).map(|t| &t.tok)
    }

    fn line(&self) -> u32 {
        self.tokens.get(self.pos).map_or(self.last_line, |t| t.line)
    }

    fn error<T>(&self, message: impl Into<String>) -> Step<T> {
        Err(Diagnostic {
            line: self.line(),
            message: message.into(),
        })
    }

    fn unexpected<T>(&self, expected: &str) -> Step<T> {
        match self.peek() {
            Some(tok) => self.error(format!("syntax error, unexpected {}, expecting {expected}", tok.describe())),
            None => self.error(format!("syntax error, unexpected end of file, expecting {expected}")),
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Step<()> {
        match self.peek() {
            Some(Tok::Punct(p)) if *p == punct => {
                self.pos += 1;
                Ok(())
            }
            _ => self.unexpected(&format!("\"{punct}\"")),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Step<()> {
        match self.peek() {
            Some(Tok::Ident(word)) if word == keyword => {
                self.pos += 1;
                Ok(())
            }
            _ => self.unexpected(&format!("\"{keyword}\"")),
        }
    }

    fn expect_ident(&mut self) -> Step<String> {
        match self.peek() {
            Some(Tok::Ident(name)) => {
                self.pos += 1;
                Ok(name.clone())
            }
            _ => self.unexpected("identifier"),
        }
    }

    fn at_section(&self, name: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(word)) if word == name)
            && matches!(self.peek_at(1), Some(Tok::Punct(":")))
    }

    /// Skip to the next `rule` keyword after an error.
    fn recover(&mut self) {
        self.pos += 1;
        while let Some(tok) = self.peek() {
            if matches!(tok, Tok::Ident(word) if word == "rule") {
                return;
            }
            self.pos += 1;
        }
    }

    fn rule(&mut self, warnings: &mut Vec<Diagnostic>) -> Step<RuleDef> {
        let line = self.line();
        self.expect_keyword("rule")?;
        let name = self.expect_ident()?;

        let mut tags = Vec::new();
        if matches!(self.peek(), Some(Tok::Punct(":"))) {
            self.pos += 1;
            while let Some(Tok::Ident(tag)) = self.peek() {
                tags.push(tag.clone());
                self.pos += 1;
            }
            if tags.is_empty() {
                return self.unexpected("tag");
            }
        }
        self.expect_punct("{")?;

        let mut metas = Vec::new();
        if self.at_section("meta") {
            self.pos += 2;
            while let Some(Tok::Ident(identifier)) = self.peek() {
                if self.at_section("strings") || self.at_section("condition") {
                    break;
                }
                let identifier = identifier.clone();
                self.pos += 1;
                self.expect_punct("=")?;
                let value = match self.peek() {
                    Some(Tok::Text(text)) => MetaLiteral::String(text.clone()),
                    Some(Tok::Int(value)) => MetaLiteral::Integer(*value),
                    Some(Tok::Ident(word)) if word == "true" => MetaLiteral::Boolean(true),
                    Some(Tok::Ident(word)) if word == "false" => MetaLiteral::Boolean(false),
                    _ => return self.unexpected("text string, integer or boolean"),
                };
                self.pos += 1;
                metas.push(MetaDef { identifier, value });
            }
        }

        let mut strings: Vec<StringDef> = Vec::new();
        let mut string_lines = Vec::new();
        if self.at_section("strings") {
            self.pos += 2;
            while let Some(Tok::StringId(identifier)) = self.peek() {
                let string_line = self.line();
                if identifier == "$" {
                    return self.error("anonymous strings are not supported");
                }
                if strings.iter().any(|s| &s.identifier == identifier) {
                    return self.error(format!("duplicated string identifier \"{identifier}\""));
                }
                let identifier = identifier.clone();
                self.pos += 1;
                self.expect_punct("=")?;
                let literal = match self.peek() {
                    Some(Tok::Text(text)) if text.is_empty() => return self.error("empty string"),
                    Some(Tok::Text(text)) => text.clone(),
                    _ => return self.unexpected("text string"),
                };
                self.pos += 1;

                let mut def = StringDef {
                    identifier,
                    literal,
                    ..Default::default()
                };
                while let Some(Tok::Ident(modifier)) = self.peek() {
                    match modifier.as_str() {
                        "nocase" => def.nocase = true,
                        "wide" => def.wide = true,
                        "ascii" => def.ascii = true,
                        "fullword" => def.fullword = true,
                        _ => break,
                    }
                    self.pos += 1;
                }
                strings.push(def);
                string_lines.push(string_line);
            }
            if strings.is_empty() {
                return self.unexpected("string identifier");
            }
        }

        if !self.at_section("condition") {
            return self.unexpected("\"condition:\"");
        }
        self.pos += 2;
        let condition = self.condition(&strings)?;
        self.expect_punct("}")?;

        let referenced: HashSet<usize> = match &condition {
            Condition::AnyOfThem | Condition::AllOfThem => (0..strings.len()).collect(),
            Condition::String(index) => [*index].into_iter().collect(),
            _ => HashSet::new(),
        };
        for (index, string) in strings.iter().enumerate() {
            if !referenced.contains(&index) {
                warnings.push(Diagnostic {
                    line: string_lines[index],
                    message: format!("string \"{}\" is not referenced in rule \"{name}\"", string.identifier),
                });
            }
        }

        Ok(RuleDef {
            name,
            line,
            tags,
            metas,
            strings,
            condition,
        })
    }

    fn condition(&mut self, strings: &[StringDef]) -> Step<Condition> {
        match self.peek() {
            Some(Tok::Ident(word)) if word == "true" || word == "false" => {
                self.pos += 1;
                Ok(Condition::Constant(word == "true"))
            }
            Some(Tok::Ident(word)) if word == "any" || word == "all" => {
                let all = word == "all";
                self.pos += 1;
                self.expect_keyword("of")?;
                self.expect_keyword("them")?;
                if strings.is_empty() {
                    return self.error("\"them\" used in a rule without strings");
                }
                Ok(if all {
                    Condition::AllOfThem
                } else {
                    Condition::AnyOfThem
                })
            }
            Some(Tok::Ident(word)) if word == "filesize" => {
                self.pos += 1;
                self.expect_punct("==")?;
                match self.peek() {
                    Some(Tok::Int(size)) if *size >= 0 => {
                        self.pos += 1;
                        Ok(Condition::FilesizeEq(*size as u64))
                    }
                    _ => self.unexpected("non-negative integer"),
                }
            }
            Some(Tok::Ident(name)) if !matches!(name.as_str(), "rule" | "meta" | "strings" | "condition") => {
                self.pos += 1;
                Ok(Condition::External(name.clone()))
            }
            Some(Tok::StringId(identifier)) => {
                match strings.iter().position(|s| &s.identifier == identifier) {
                    Some(index) => {
                        self.pos += 1;
                        Ok(Condition::String(index))
                    }
                    None => self.error(format!("undefined string identifier \"{identifier}\"")),
                }
            }
            _ => self.unexpected("condition"),
        }
    }
}

/// Parse a whole source text.
pub(crate) fn parse(source: &str) -> Parsed {
    let mut parsed = Parsed::default();
    let tokens = tokenize(source, &mut parsed.errors);
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        last_line: tokens.last().map_or(1, |t| t.line),
    };
    let mut names = HashSet::new();

    while parser.peek().is_some() {
        match parser.rule(&mut parsed.warnings) {
            Ok(rule) => {
                if !names.insert(rule.name.clone()) {
                    parsed.errors.push(Diagnostic {
                        line: rule.line,
                        message: format!("duplicated identifier \"{}\"", rule.name),
                    });
                } else {
                    parsed.rules.push(rule);
                }
            }
            Err(diagnostic) => {
                parsed.errors.push(diagnostic);
                parser.recover();
            }
        }
    }
    parsed.errors.sort_by_key(|d| d.line);
    parsed
}
