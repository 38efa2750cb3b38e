//! `root_squash` (the exports-file default) maps a caller claiming uid 0
//! onto the export's anonymous uid before any filesystem syscall runs, so
//! a root client cannot read a file it would only be able to read as root
//! — the root-squash scenario. Demonstrating the denial needs a real
//! identity switch (`setfsuid`/`seteuid`, `CAP_SETUID`), so this test
//! skips itself when not running privileged, the same accommodation
//! `cred.rs`'s own unit tests make.

mod common;

use rnfsd::error::Stat;
use rnfsd::export::{ExportOptions, Pattern};
use rnfsd::rpc::{Credential, UnixCred};

fn root_credential() -> Credential {
    Credential::Unix(UnixCred { stamp: 1, machine_name: "root-client".into(), uid: 0, gid: 0, gids: Vec::new() })
}

#[test]
fn a_root_claim_is_squashed_to_the_anonymous_uid() {
    if !common::running_privileged() {
        eprintln!("skipping: requires CAP_SETUID to demonstrate a real identity switch");
        return;
    }

    let root = tempfile::tempdir().unwrap();
    let secret = root.path().join("secret");
    std::fs::write(&secret, b"root-only\n").unwrap();
    std::fs::set_permissions(&secret, std::os::unix::fs::PermissionsExt::from_mode(0o600)).unwrap();

    let pattern = Pattern::AddrMask(std::net::Ipv4Addr::new(10, 0, 0, 0), 0xFFFF_FF00);
    // root_squash defaults to true; anon_uid/anon_gid default to 65534.
    let options = ExportOptions { secure_port: false, ..Default::default() };
    let (mut server, _state) = common::test_server(root.path(), pattern, options);

    let caller = common::caller_from([10, 0, 0, 5], 700);
    let credential = root_credential();

    let (stat, handle) = common::mnt(&mut server, caller, &credential, &root.path().to_string_lossy());
    assert_eq!(stat, 0);
    let handle = handle.unwrap();

    let (stat, looked_up) = common::lookup(&mut server, caller, &credential, &handle, "secret");
    assert_eq!(stat, 0);
    let (file_handle, _) = looked_up.unwrap();

    let (stat, result) = common::read(&mut server, caller, &credential, &file_handle, 0, 64);
    assert_eq!(stat, Stat::Access as u32, "a squashed root claim must not read a 600 file it does not own");
    assert!(result.is_none());
}

#[test]
fn getattr_reports_the_squashed_owner_unaffected_by_squash_for_reads() {
    let root = tempfile::tempdir().unwrap();
    let pattern = Pattern::AddrMask(std::net::Ipv4Addr::new(10, 0, 0, 0), 0xFFFF_FF00);
    let options = ExportOptions { secure_port: false, ..Default::default() };
    let (mut server, _state) = common::test_server(root.path(), pattern, options);
    std::fs::write(root.path().join("f"), b"x").unwrap();

    let caller = common::caller_from([10, 0, 0, 5], 700);
    let credential = root_credential();
    let (_, handle) = common::mnt(&mut server, caller, &credential, &root.path().to_string_lossy());
    let handle = handle.unwrap();

    // GETATTR never switches identity, so it always succeeds regardless of
    // squash or privilege, unlike READ/WRITE/SETATTR above.
    let (stat, fattr) = common::getattr(&mut server, caller, &credential, &handle);
    assert_eq!(stat, 0);
    assert!(fattr.is_some());
}
