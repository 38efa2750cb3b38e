//! A handle that has fallen out of the file-handle cache (eviction, or a
//! restart that starts with an empty cache) is rebuilt by walking the
//! known export roots and re-deriving the same ancestor hash chain — the
//! stale-handle-rebuild scenario — rather than failing `stale` outright.

mod common;

use rnfsd::export::{ExportOptions, Pattern};

#[test]
fn a_handle_dropped_from_cache_is_rebuilt_from_the_export_root() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("a")).unwrap();
    std::fs::create_dir(root.path().join("a").join("b")).unwrap();
    std::fs::write(root.path().join("a").join("b").join("deep.txt"), b"hi\n").unwrap();

    let pattern = Pattern::AddrMask(std::net::Ipv4Addr::new(10, 0, 0, 0), 0xFFFF_FF00);
    let options = ExportOptions { secure_port: false, root_squash: false, ..Default::default() };
    let (mut server, _state) = common::test_server(root.path(), pattern, options);

    let caller = common::caller_from([10, 0, 0, 5], 700);
    let credential = common::anon_credential();

    let (_, root_handle) = common::mnt(&mut server, caller, &credential, &root.path().to_string_lossy());
    let root_handle = root_handle.unwrap();
    let (_, a) = common::lookup(&mut server, caller, &credential, &root_handle, "a");
    let (a_handle, _) = a.unwrap();
    let (_, b) = common::lookup(&mut server, caller, &credential, &a_handle, "b");
    let (b_handle, _) = b.unwrap();
    let (_, deep) = common::lookup(&mut server, caller, &credential, &b_handle, "deep.txt");
    let (deep_handle, fattr_before) = deep.unwrap();
    assert_eq!(fattr_before.size, 3);

    // Simulate everything falling out of the cache (a restart, or the
    // periodic discard sweep), keeping the export roots the rebuilder
    // needs to walk.
    server.cache = rnfsd::cache::FileHandleCache::new(64);
    assert_eq!(server.cache.len(), 0);

    let (stat, fattr_after) = common::getattr(&mut server, caller, &credential, &deep_handle);
    assert_eq!(stat, 0, "a handle for a still-existing file must rebuild rather than report stale");
    assert_eq!(fattr_after.unwrap().size, 3);
}

#[test]
fn a_handle_for_a_deleted_file_reports_stale_after_eviction() {
    let root = tempfile::tempdir().unwrap();
    let victim = root.path().join("gone.txt");
    std::fs::write(&victim, b"x").unwrap();

    let pattern = Pattern::AddrMask(std::net::Ipv4Addr::new(10, 0, 0, 0), 0xFFFF_FF00);
    let options = ExportOptions { secure_port: false, root_squash: false, ..Default::default() };
    let (mut server, _state) = common::test_server(root.path(), pattern, options);

    let caller = common::caller_from([10, 0, 0, 5], 700);
    let credential = common::anon_credential();
    let (_, root_handle) = common::mnt(&mut server, caller, &credential, &root.path().to_string_lossy());
    let root_handle = root_handle.unwrap();
    let (_, looked_up) = common::lookup(&mut server, caller, &credential, &root_handle, "gone.txt");
    let (handle, _) = looked_up.unwrap();

    std::fs::remove_file(&victim).unwrap();
    server.cache = rnfsd::cache::FileHandleCache::new(64);

    let (stat, fattr) = common::getattr(&mut server, caller, &credential, &handle);
    assert_eq!(stat, rnfsd::error::Stat::Stale as u32);
    assert!(fattr.is_none());
}
