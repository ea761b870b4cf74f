//! Path-escape tests for the local artifact store.
//!
//! Every hostile key must fail before the filesystem is touched: no file is
//! written anywhere under the temp root, and nothing outside it changes.

use std::fs;
use std::path::Path;

use flowcore::io::store::{ArtifactStore, LocalArtifactStore, StoreError};
use flowcore::test_support::temp_local_store;

fn files_under(root: &Path) -> Vec<String> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries {
            let path = entry.expect("entry").path();
            if path.is_dir() {
                stack.push(path);
            } else {
                found.push(path.display().to_string());
            }
        }
    }
    found
}

/// Classic traversal payloads resolve to a denylisted segment and are rejected.
#[test]
fn traversal_keys_fail_with_sensitive_path_and_write_nothing() {
    let (temp, store) = temp_local_store().expect("store");

    for key in ["../../etc/passwd", "/etc/passwd", "a/../../../etc/x"] {
        let err = store.write(key, b"pwned").unwrap_err();
        assert!(
            matches!(err, StoreError::SensitivePath { ref segment, .. } if segment == "etc"),
            "{key}: {err}"
        );
        assert!(!store.exists("passwd").expect("exists"));
    }

    assert!(files_under(temp.path()).is_empty());
}

#[test]
fn mixed_case_and_backslash_variants_are_rejected() {
    let (temp, store) = temp_local_store().expect("store");

    for key in ["..\\..\\ETC\\shadow", "x/Proc/self/environ", "Windows\\System32\\drivers"] {
        let err = store.write(key, b"pwned").unwrap_err();
        assert!(matches!(err, StoreError::SensitivePath { .. }), "{key}: {err}");
    }
    for key in ["C:\\temp\\x", "", "../.."] {
        let err = store.write(key, b"pwned").unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)), "{key:?}: {err}");
    }

    assert!(files_under(temp.path()).is_empty());
}

/// Traversal that only mentions safe names is neutralized, not rejected: it
/// lands inside the base directory.
#[test]
fn benign_traversal_is_confined_to_base_dir() {
    let (temp, store) = temp_local_store().expect("store");

    let locator = store.write("../../reports/summary.txt", b"ok").expect("write");

    assert_eq!(locator.key, "reports/summary.txt");
    assert_eq!(store.read("reports/summary.txt").expect("read"), b"ok");
    let written = files_under(temp.path());
    assert_eq!(written.len(), 1);
    assert!(Path::new(&written[0]).starts_with(store.base_dir()));
}

#[cfg(unix)]
#[test]
fn symlinks_are_not_listed() {
    let (temp, store) = temp_local_store().expect("store");
    store.write("real.txt", b"data").expect("write");
    let outside = temp.path().join("outside.txt");
    fs::write(&outside, b"secret").expect("write outside");
    std::os::unix::fs::symlink(&outside, store.base_dir().join("link.txt")).expect("symlink");

    assert_eq!(store.list("").expect("list"), vec!["real.txt".to_string()]);
}

#[test]
fn store_is_shareable_across_threads() {
    let (_temp, store) = temp_local_store().expect("store");

    std::thread::scope(|scope| {
        for n in 0..4 {
            let store: &LocalArtifactStore = &store;
            scope.spawn(move || {
                store
                    .write(&format!("workers/{n}.txt"), n.to_string().as_bytes())
                    .expect("write");
            });
        }
    });

    assert_eq!(store.list("workers").expect("list").len(), 4);
}
