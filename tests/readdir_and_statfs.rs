//! `READDIR` lists a directory's entries with `.`/`..` included and a
//! cookie usable to resume a listing, and `STATFS` reports the fixed
//! transfer/block sizes alongside real free-space counts.

mod common;

use rnfsd::export::{ExportOptions, Pattern};

#[test]
fn readdir_lists_every_entry_and_reports_eof() {
    let root = tempfile::tempdir().unwrap();
    for name in ["one", "two", "three"] {
        std::fs::write(root.path().join(name), b"x").unwrap();
    }

    let pattern = Pattern::AddrMask(std::net::Ipv4Addr::new(10, 0, 0, 0), 0xFFFF_FF00);
    let options = ExportOptions { secure_port: false, root_squash: false, ..Default::default() };
    let (mut server, _state) = common::test_server(root.path(), pattern, options);

    let caller = common::caller_from([10, 0, 0, 5], 700);
    let credential = common::anon_credential();
    let (_, root_handle) = common::mnt(&mut server, caller, &credential, &root.path().to_string_lossy());
    let root_handle = root_handle.unwrap();

    let (stat, result) = common::readdir(&mut server, caller, &credential, &root_handle, 0, 4096);
    assert_eq!(stat, 0);
    let (entries, eof) = result.unwrap();
    assert!(eof, "a single READDIR call with ample maxcount must exhaust the directory");
    let names: Vec<&str> = entries.iter().map(|(_, name, _)| name.as_str()).collect();
    for expected in [".", "..", "one", "two", "three"] {
        assert!(names.contains(&expected), "missing {expected:?} in {names:?}");
    }
}

#[test]
fn readdir_resumes_from_a_cookie_when_maxcount_is_tight() {
    let root = tempfile::tempdir().unwrap();
    for name in ["one", "two", "three", "four", "five"] {
        std::fs::write(root.path().join(name), b"x").unwrap();
    }

    let pattern = Pattern::AddrMask(std::net::Ipv4Addr::new(10, 0, 0, 0), 0xFFFF_FF00);
    let options = ExportOptions { secure_port: false, root_squash: false, ..Default::default() };
    let (mut server, _state) = common::test_server(root.path(), pattern, options);

    let caller = common::caller_from([10, 0, 0, 5], 700);
    let credential = common::anon_credential();
    let (_, root_handle) = common::mnt(&mut server, caller, &credential, &root.path().to_string_lossy());
    let root_handle = root_handle.unwrap();

    let mut seen = std::collections::HashSet::new();
    let mut cookie = 0u32;
    loop {
        let (stat, result) = common::readdir(&mut server, caller, &credential, &root_handle, cookie, 64);
        assert_eq!(stat, 0);
        let (entries, eof) = result.unwrap();
        assert!(!entries.is_empty(), "a tight maxcount must still make forward progress");
        for (_, name, next_cookie) in &entries {
            seen.insert(name.clone());
            cookie = *next_cookie;
        }
        if eof {
            break;
        }
    }
    for expected in [".", "..", "one", "two", "three", "four", "five"] {
        assert!(seen.contains(expected), "missing {expected:?} across the resumed listing");
    }
}

#[test]
fn statfs_reports_the_fixed_transfer_and_block_sizes() {
    let root = tempfile::tempdir().unwrap();
    let pattern = Pattern::AddrMask(std::net::Ipv4Addr::new(10, 0, 0, 0), 0xFFFF_FF00);
    let options = ExportOptions { secure_port: false, root_squash: false, ..Default::default() };
    let (mut server, _state) = common::test_server(root.path(), pattern, options);

    let caller = common::caller_from([10, 0, 0, 5], 700);
    let credential = common::anon_credential();
    let (_, root_handle) = common::mnt(&mut server, caller, &credential, &root.path().to_string_lossy());
    let root_handle = root_handle.unwrap();

    let (stat, result) = common::statfs(&mut server, caller, &credential, &root_handle);
    assert_eq!(stat, 0);
    let [tsize, bsize, blocks, bfree, bavail] = result.unwrap();
    assert_eq!(tsize, rnfsd::nfs::attr::STATFS_TSIZE);
    assert_eq!(bsize, rnfsd::nfs::attr::STATFS_BSIZE);
    assert!(blocks >= bfree, "total blocks can never be smaller than free blocks");
    assert!(bfree >= bavail, "free blocks can never be smaller than blocks available to an unprivileged writer");
}
