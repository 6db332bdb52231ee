//! Concurrent use of shared rulesets.
//!
//! Scans from many threads share one native handle and one process-wide
//! token registry; each scan must see only its own results. A release racing
//! with scans either waits for them or makes them fail cleanly.

use rayon::prelude::*;
use rulebridge::{mock, BridgeError, Rules, ScanConfig};
use std::sync::{Arc, Barrier};
use std::thread;

const SOURCE: &str = r#"
rule marker { strings: $m = "marker" condition: $m }
rule digits { strings: $d = "0123" condition: $d }
"#;

fn payload(id: usize) -> Vec<u8> {
    let mut data = format!("thread {id} ").into_bytes();
    for _ in 0..(id % 5) + 1 {
        data.extend_from_slice(b"marker ");
    }
    if id % 2 == 0 {
        data.extend_from_slice(b"0123");
    }
    data
}

#[test]
fn test_parallel_scans_see_only_their_own_results() {
    let rules = Rules::compile(&mock::engine(), SOURCE, None).unwrap();

    let results: Vec<_> = (0..256usize)
        .into_par_iter()
        .map(|id| (id, rules.scan_mem(&payload(id), &ScanConfig::default()).unwrap()))
        .collect();

    for (id, matches) in results {
        let expected_rules = if id % 2 == 0 { 2 } else { 1 };
        assert_eq!(matches.len(), expected_rules, "scan {id}");
        assert_eq!(matches[0].rule, "marker");
        assert_eq!(matches[0].strings.len(), id % 5 + 1, "scan {id}");
    }
    rules.release();
}

#[test]
fn test_scans_from_threads_with_cloned_rules() {
    let rules = Rules::compile(&mock::engine(), SOURCE, None).unwrap();
    let barrier = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (0..8)
        .map(|id| {
            let rules = rules.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..50)
                    .map(|_| rules.scan_mem(&payload(id), &ScanConfig::default()).unwrap().len())
                    .sum::<usize>()
            })
        })
        .collect();

    for (id, worker) in workers.into_iter().enumerate() {
        let expected = if id % 2 == 0 { 2 } else { 1 };
        assert_eq!(worker.join().unwrap(), expected * 50);
    }
    rules.release();
}

#[test]
fn test_release_racing_with_scans() {
    let rules = Rules::compile(&mock::engine(), SOURCE, None).unwrap();
    let barrier = Arc::new(Barrier::new(5));

    let scanners: Vec<_> = (0..4)
        .map(|id| {
            let rules = rules.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..200 {
                    match rules.scan_mem(&payload(id), &ScanConfig::default()) {
                        Ok(matches) => assert!(!matches.is_empty()),
                        Err(err) => {
                            assert_eq!(err, BridgeError::UseAfterRelease);
                            return true;
                        }
                    }
                }
                false
            })
        })
        .collect();

    barrier.wait();
    let releases: usize = (0..4)
        .into_par_iter()
        .map(|_| usize::from(rules.release()))
        .sum();
    assert_eq!(releases, 1);

    for scanner in scanners {
        scanner.join().unwrap();
    }
    assert!(rules.is_released());
}

#[test]
fn test_parallel_compilation() {
    let engine = mock::engine();
    let compiled: Vec<Rules> = (0..32)
        .into_par_iter()
        .map(|i| {
            let source = format!(r#"rule r{i} {{ strings: $a = "needle{i}" condition: $a }}"#);
            Rules::compile(&engine, &source, Some(&format!("ns{i}"))).unwrap()
        })
        .collect();

    for (i, rules) in compiled.iter().enumerate() {
        let data = format!("hay needle{i} hay");
        let matches = rules.scan_mem(data.as_bytes(), &ScanConfig::default()).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].namespace, format!("ns{i}"));
        rules.release();
    }
}
