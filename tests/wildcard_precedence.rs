//! Two overlapping wildcard patterns exported with different options must
//! resolve a client against the *longer* (more specific) pattern, not
//! whichever was registered first — the wildcard-precedence scenario.
//! Told apart here via `SETATTR`'s read-only check, which runs before any
//! identity switch and so needs no privilege to exercise.

mod common;

use rnfsd::error::Stat;
use rnfsd::export::{ExportDb, ExportOptions, Pattern};
use rnfsd::wire::{self, Decoder, Encoder};

fn two_pattern_server(root: &std::path::Path) -> (rnfsd::server::Server, tempfile::TempDir) {
    let state = tempfile::tempdir().unwrap();
    let mut db = ExportDb::new();
    db.add_export(&Pattern::Wildcard("*.corp".into()), root.to_string_lossy(), ExportOptions {
        secure_port: false,
        read_only: true,
        ..Default::default()
    });
    db.add_export(&Pattern::Wildcard("*.lab.corp".into()), root.to_string_lossy(), ExportOptions {
        secure_port: false,
        read_only: false,
        ..Default::default()
    });
    let devtable = rnfsd::devtable::DeviceTable::open(state.path().join("devtab")).unwrap();
    let rmtab = rnfsd::rmtab::RemoteMountLog::open(state.path().join("rmtab")).unwrap();
    let server = rnfsd::server::Server::new(db, vec![root.to_path_buf()], devtable, rmtab, &rnfsd::server::Tunables::default());
    (server, state)
}

/// `SETATTR` with every field left "unchanged" — enough to hit the
/// read-only gate without the actual chmod/chown going through a cred
/// switch this test shouldn't need privilege for.
fn setattr_noop(server: &mut rnfsd::server::Server, caller: std::net::SocketAddr, credential: &rnfsd::rpc::Credential, handle: &[u8; rnfsd::handle::HANDLE_SIZE]) -> u32 {
    let mut args = Vec::new();
    wire::put_fixed(&mut args, handle).unwrap();
    for _ in 0..4 {
        wire::put_u32(&mut args, 0xFFFF_FFFF).unwrap();
    }
    wire::put_u32(&mut args, 0xFFFF_FFFF).unwrap();
    wire::put_u32(&mut args, 0xFFFF_FFFF).unwrap();
    wire::put_u32(&mut args, 0xFFFF_FFFF).unwrap();
    wire::put_u32(&mut args, 0xFFFF_FFFF).unwrap();
    let mut src: Decoder<'_> = std::io::Cursor::new(args.as_slice());
    let mut dst: Encoder = Vec::new();
    rnfsd::nfs::dispatch(server, caller, credential, rnfsd::nfs::Proc::SetAttr as u32, &mut src, &mut dst).unwrap();
    let mut reply = std::io::Cursor::new(dst.as_slice());
    wire::get_u32(&mut reply).unwrap()
}

#[test]
fn the_longer_wildcard_pattern_wins() {
    let root = tempfile::tempdir().unwrap();
    let (mut server, _state) = two_pattern_server(root.path());
    server.dns = Box::new(common::FixedName("build3.lab.corp"));

    let caller = common::caller_from([10, 0, 0, 9], 700);
    let credential = common::anon_credential();
    let (stat, handle) = common::mnt(&mut server, caller, &credential, &root.path().to_string_lossy());
    assert_eq!(stat, 0);
    let handle = handle.unwrap();

    let stat = setattr_noop(&mut server, caller, &credential, &handle);
    assert_ne!(stat, Stat::RoFs as u32, "*.lab.corp's rw mount must win over *.corp's ro one for a more specific name");
}

#[test]
fn a_name_matching_only_the_shorter_pattern_gets_its_read_only_options() {
    let root = tempfile::tempdir().unwrap();
    let (mut server, _state) = two_pattern_server(root.path());
    server.dns = Box::new(common::FixedName("desktop7.corp"));

    let caller = common::caller_from([10, 0, 0, 10], 700);
    let credential = common::anon_credential();
    let (stat, handle) = common::mnt(&mut server, caller, &credential, &root.path().to_string_lossy());
    assert_eq!(stat, 0);
    let handle = handle.unwrap();

    let stat = setattr_noop(&mut server, caller, &credential, &handle);
    assert_eq!(stat, Stat::RoFs as u32, "desktop7.corp only matches *.corp's read-only export");
}
