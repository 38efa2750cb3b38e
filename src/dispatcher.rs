//! RPC dispatcher (spec §4.K): turns one incoming datagram into an
//! authorized NFS or MOUNT reply, following the original's 7-step
//! algorithm exactly.
//!
//! Grounded in `mount_dispatch.c`'s per-version procedure tables (the
//! program/version routing below) and its `_rpcsvcdirty`/`need_reinit`
//! pair (the *dirty*-flag deferred-reinitialization [`Signals`] mechanism
//! spec §4.K calls out). The teacher splits network I/O and procedure
//! dispatch across `read_task.rs`/`write_task.rs`/`vfs_task.rs`, each its
//! own spawned tokio task feeding a channel; this dispatcher collapses
//! that into a single task that reads, dispatches, and replies in line,
//! because spec §5 requires "a single sequential dispatcher process" —
//! spawning a task per request would let two calls run concurrently
//! within one `ncopies` worker, which the spec's suspension-point model
//! does not allow. `tokio`'s current-thread runtime is kept only as the
//! substitute for the original's `select(2)` loop (multiplexing the
//! socket against the signal-driven wakeups `main` installs), not as a
//! concurrency mechanism.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::mount;
use crate::nfs;
use crate::rpc::{self, AcceptStat};
use crate::server::Server;

/// Largest UDP datagram this server accepts: headroom above
/// [`nfs::MAX_TRANSFER`] for the RPC/XDR envelope around a WRITE payload.
const MAX_DATAGRAM: usize = nfs::MAX_TRANSFER + 4 * 1024;

/// The signals a dispatcher defers while a call is in flight (spec §4.K:
/// "A boolean *dirty* flag is set around steps 3-6; signal handlers that
/// would mutate shared state defer when dirty is true."). `main` sets
/// these from its `signal-hook`/`tokio::signal` handlers; the dispatcher
/// only ever clears them, at step 7.
#[derive(Default)]
pub struct Signals {
    reload_exports: AtomicBool,
    toggle_debug: AtomicBool,
    flush_cache: AtomicBool,
    terminate: AtomicBool,
}

impl Signals {
    pub fn request_reload(&self) {
        self.reload_exports.store(true, Ordering::SeqCst);
    }

    pub fn request_debug_toggle(&self) {
        self.toggle_debug.store(true, Ordering::SeqCst);
    }

    pub fn request_flush(&self) {
        self.flush_cache.store(true, Ordering::SeqCst);
    }

    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn should_terminate(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }
}

enum Program {
    Nfs,
    Mount,
}

fn route_program(program: u32) -> Option<Program> {
    match program {
        n if n == nfs::PROGRAM => Some(Program::Nfs),
        m if m == mount::PROGRAM => Some(Program::Mount),
        _ => None,
    }
}

enum Routed {
    Handled,
    ProcUnavailable,
}

/// Binds the dispatcher's socket to `addr` (spec §6: `-P PORT`; portmapper
/// registration is an out-of-scope external collaborator per §1, so this
/// only binds — it never calls into a portmap service).
pub async fn bind(addr: SocketAddr) -> io::Result<UdpSocket> {
    UdpSocket::bind(addr).await
}

/// Drives one dispatcher process's request loop against `server` until a
/// `SIGTERM` sets [`Signals::request_terminate`] (spec §5: "exit after
/// the current reply").
pub struct Dispatcher {
    server: Server,
    socket: UdpSocket,
    signals: Arc<Signals>,
    on_reload: Box<dyn FnMut(&mut Server) + Send>,
    on_debug_toggle: Box<dyn FnMut() + Send>,
}

impl Dispatcher {
    pub fn new(
        server: Server,
        socket: UdpSocket,
        signals: Arc<Signals>,
        on_reload: Box<dyn FnMut(&mut Server) + Send>,
        on_debug_toggle: Box<dyn FnMut() + Send>,
    ) -> Self {
        Dispatcher { server, socket, signals, on_reload, on_debug_toggle }
    }

    pub async fn run(&mut self) -> io::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while !self.signals.should_terminate() {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            self.handle_datagram(&buf[..len], from).await;
            self.service_deferred_signals();
        }
        Ok(())
    }

    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let mut src = std::io::Cursor::new(datagram);
        let call = match rpc::decode_call(&mut src) {
            Ok(call) => call,
            // Not well-formed enough to even carry an xid worth replying to.
            Err(_) => return,
        };

        let mut body = Vec::new();
        let routed = match route_program(call.program) {
            None => Err(AcceptStat::ProgUnavail),
            Some(Program::Nfs) if call.version != nfs::VERSION => Err(AcceptStat::ProgMismatch),
            Some(Program::Mount) if call.version != mount::VERSION_1 && call.version != mount::VERSION_2 => Err(AcceptStat::ProgMismatch),
            Some(Program::Nfs) => nfs::dispatch(&mut self.server, from, &call.credential, call.procedure, &mut src, &mut body)
                .map(|outcome| match outcome {
                    nfs::Outcome::Handled => Routed::Handled,
                    nfs::Outcome::ProcUnavailable => Routed::ProcUnavailable,
                })
                .map_err(|_| AcceptStat::GarbageArgs),
            Some(Program::Mount) => mount::dispatch(&mut self.server, from, &call.credential, call.procedure, &mut src, &mut body)
                .map(|outcome| match outcome {
                    mount::Outcome::Handled => Routed::Handled,
                    mount::Outcome::ProcUnavailable => Routed::ProcUnavailable,
                })
                .map_err(|_| AcceptStat::GarbageArgs),
        };

        let mut dst = Vec::new();
        match routed {
            Ok(Routed::Handled) => {
                rpc::encode_success(&mut dst, call.xid);
                dst.extend_from_slice(&body);
            }
            Ok(Routed::ProcUnavailable) => rpc::encode_accept_error(&mut dst, call.xid, AcceptStat::ProcUnavail),
            Err(stat) => rpc::encode_accept_error(&mut dst, call.xid, stat),
        }

        if let Err(err) = self.socket.send_to(&dst, from).await {
            tracing::warn!(error = %err, peer = %from, "failed to send RPC reply");
        }
    }

    /// Step 7: service whatever arrived mid-call, now that dirty's false.
    fn service_deferred_signals(&mut self) {
        if self.signals.reload_exports.swap(false, Ordering::SeqCst) {
            (self.on_reload)(&mut self.server);
        }
        if self.signals.toggle_debug.swap(false, Ordering::SeqCst) {
            (self.on_debug_toggle)();
        }
        if self.signals.flush_cache.swap(false, Ordering::SeqCst) {
            self.server.cache.flush(false);
            self.server.export_db.flush_anonymous_cache();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_program_recognizes_nfs_and_mount() {
        assert!(matches!(route_program(nfs::PROGRAM), Some(Program::Nfs)));
        assert!(matches!(route_program(mount::PROGRAM), Some(Program::Mount)));
        assert!(route_program(100000).is_none());
    }

    #[test]
    fn signals_clear_after_being_read() {
        let signals = Signals::default();
        signals.request_reload();
        assert!(signals.reload_exports.swap(false, Ordering::SeqCst));
        assert!(!signals.reload_exports.load(Ordering::SeqCst));
    }

    #[test]
    fn terminate_flag_is_observable() {
        let signals = Signals::default();
        assert!(!signals.should_terminate());
        signals.request_terminate();
        assert!(signals.should_terminate());
    }
}
