//! Saving and loading compiled rules through managed readers and writers.
//!
//! The engine drives these streams in fixed-size chunks and element-sized
//! reads, so the readers and writers here deliberately misbehave: short
//! reads, failing writes and truncated or foreign input.

use rulebridge::{mock, BridgeError, Rules, ScanConfig};
use std::io::{self, Read, Write};

const SOURCE: &str = r#"
rule persisted : keep {
    meta:
        version = 3
    strings:
        $a = "persist" nocase
        $b = "me" wide
    condition:
        any of them
}
rule external_gate { condition: enabled }
"#;

fn compiled() -> Rules {
    let mut compiler = rulebridge::Compiler::new(&mock::engine()).unwrap();
    compiler.define_variable("enabled", true).unwrap();
    compiler.add_string(SOURCE, Some("saved")).unwrap();
    compiler.into_rules().unwrap()
}

fn saved_bytes(rules: &Rules) -> Vec<u8> {
    let mut out = Vec::new();
    rules.write(&mut out).unwrap();
    out
}

/// Hands out at most one byte per read call.
struct Trickle<'a>(&'a [u8]);

impl Read for Trickle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match (self.0.split_first(), buf.first_mut()) {
            (Some((byte, rest)), Some(slot)) => {
                *slot = *byte;
                self.0 = rest;
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

/// Accepts `remaining` bytes, then fails every write.
struct Failing {
    written: Vec<u8>,
    remaining: usize,
}

impl Write for Failing {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::new(io::ErrorKind::StorageFull, "disk full"));
        }
        let n = buf.len().min(self.remaining);
        self.written.extend_from_slice(&buf[..n]);
        self.remaining -= n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Fails every read with a managed error.
struct Broken;

impl Read for Broken {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer went away"))
    }
}

#[test]
fn test_round_trip_preserves_behaviour() {
    let rules = compiled();
    let saved = saved_bytes(&rules);
    assert!(saved.starts_with(mock::MAGIC));
    assert_eq!(saved[4..8], mock::FORMAT_VERSION.to_le_bytes());

    let restored = Rules::read(&mock::engine(), &mut saved.as_slice()).unwrap();
    let config = ScanConfig::default();
    for data in [&b"PERSIST"[..], b"m\0e\0", b"nothing"] {
        assert_eq!(
            rules.scan_mem(data, &config).unwrap(),
            restored.scan_mem(data, &config).unwrap()
        );
    }
    let matches = restored.scan_mem(b"PERSIST", &config).unwrap();
    assert_eq!(matches[0].namespace, "saved");
    assert_eq!(matches[1].rule, "external_gate");

    // Re-serializing the restored rules yields identical bytes.
    assert_eq!(saved_bytes(&restored), saved);
    rules.release();
    restored.release();
}

#[test]
fn test_trickling_reader_loads() {
    let rules = compiled();
    let saved = saved_bytes(&rules);
    let restored = Rules::read(&mock::engine(), &mut Trickle(&saved)).unwrap();
    assert_eq!(restored.scan_mem(b"persist", &ScanConfig::default()).unwrap().len(), 2);
    rules.release();
    restored.release();
}

#[test]
fn test_failing_writer_reports_io_error() {
    let rules = compiled();
    let mut writer = Failing {
        written: Vec::new(),
        remaining: 10,
    };
    let err = rules.write(&mut writer).unwrap_err();
    match err {
        BridgeError::Io(message) => assert!(message.contains("disk full")),
        other => panic!("expected an io error, got {other:?}"),
    }
    assert_eq!(writer.written.len(), 10);
    assert!(!rules.is_released());
    rules.release();
}

#[test]
fn test_failing_reader_reports_io_error() {
    let err = Rules::read(&mock::engine(), &mut Broken).unwrap_err();
    match err {
        BridgeError::Io(message) => assert!(message.contains("peer went away")),
        other => panic!("expected an io error, got {other:?}"),
    }
}

#[test]
fn test_foreign_data_is_corrupt() {
    let engine = mock::engine();
    for data in [&b""[..], b"RB", b"PK\x03\x04 not ours at all"] {
        let err = Rules::read(&engine, &mut &data[..]).unwrap_err();
        assert_eq!(err, BridgeError::CorruptSerializedState, "input {data:?}");
    }
}

#[test]
fn test_truncated_stream_is_corrupt() {
    let rules = compiled();
    let saved = saved_bytes(&rules);
    for cut in [8, saved.len() / 2, saved.len() - 1] {
        let err = Rules::read(&mock::engine(), &mut &saved[..cut]).unwrap_err();
        assert_eq!(err, BridgeError::CorruptSerializedState, "cut at {cut}");
    }
    rules.release();
}

#[test]
fn test_future_version_is_unsupported() {
    let mut data = mock::MAGIC.to_vec();
    data.extend_from_slice(&(mock::FORMAT_VERSION + 1).to_le_bytes());
    data.extend_from_slice(&[0; 8]);
    let err = Rules::read(&mock::engine(), &mut data.as_slice()).unwrap_err();
    assert_eq!(err, BridgeError::UnsupportedFileVersion);
}

#[test]
fn test_save_and_load_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.rbmk");
    let rules = compiled();
    rules.save(&path).unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), saved_bytes(&rules));

    let loaded = Rules::load(&mock::engine(), &path).unwrap();
    assert_eq!(loaded.scan_mem(b"persist", &ScanConfig::default()).unwrap().len(), 2);

    let missing = dir.path().join("missing.rbmk");
    assert!(matches!(
        Rules::load(&mock::engine(), &missing).unwrap_err(),
        BridgeError::Io(_)
    ));
    rules.release();
    loaded.release();
}
