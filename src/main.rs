//! `rnfsd`: entry point wiring the CLI surface (spec §6) to the dispatcher
//! (4.K). Parses flags, loads the exports file and tunables, builds a
//! [`Server`], installs the signal handlers §5 describes, and hands off
//! to [`Dispatcher::run`]. Optionally forks under the failsafe supervisor
//! (§5, §4 "Failsafe mode") before any of that happens.
//!
//! Grounded in the original server's `nfsd.c`/`mountd.c` `main()`
//! (argument parsing order, `-z` forking before socket setup, `-F`
//! suppressing the fork-into-background step) and the teacher's
//! `examples/shadow_fs/main.rs` for how this codebase's own author wires
//! a `clap`-parsed CLI to a `tokio` server loop.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use rnfsd::config::{self, Tunables};
use rnfsd::devtable::DeviceTable;
use rnfsd::dispatcher::{self, Dispatcher, Signals};
use rnfsd::export::{ExportDb, Pattern};
use rnfsd::rmtab::RemoteMountLog;
use rnfsd::server::Server;

/// Debug facilities named in spec §6: each becomes a `tracing` target
/// under the `rnfsd::` prefix raised to `debug` level by `-d`.
const FACILITIES: &[&str] = &["auth", "call", "fhcache", "fhtrace", "devtab", "general", "rmtab", "ugid", "stale"];

#[derive(Parser, Debug)]
#[command(name = "rnfsd", about = "A user-space NFSv2/MOUNT server", version)]
struct Cli {
    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'F')]
    foreground: bool,

    /// Enable a debug facility; may be given more than once. One of:
    /// auth, call, fhcache, fhtrace, devtab, general, rmtab, ugid, stale, all.
    #[arg(short = 'd', value_name = "KIND")]
    debug: Vec<String>,

    /// Exports file to read.
    #[arg(short = 'f', value_name = "FILE", default_value = "/etc/exports")]
    exports_file: PathBuf,

    /// Waive the privileged-source-port check for `secure` exports.
    #[arg(short = 'n')]
    waive_secure_port: bool,

    /// UDP/TCP port to bind, instead of the standard NFS port.
    #[arg(short = 'P', value_name = "PORT", default_value_t = 2049)]
    port: u16,

    /// Promiscuous mode: synthesize a default client for any address.
    #[arg(short = 'p')]
    promiscuous: bool,

    /// Allow re-exporting filesystems that are themselves network mounts.
    #[arg(short = 'r')]
    allow_reexport: bool,

    /// Designate PATH as the NFSv2 public root (the `=public` exports-file target).
    #[arg(short = 'R', value_name = "PATH")]
    public_root: Option<PathBuf>,

    /// Log READ/WRITE transfers.
    #[arg(short = 'l')]
    log_transfers: bool,

    /// Suppress host-spoof warnings.
    #[arg(short = 't')]
    suppress_spoof_warnings: bool,

    /// Disable cross-mount-point directory traversal.
    #[arg(short = 'x')]
    disable_cross_mount: bool,

    /// Enable failsafe mode (optionally at LEVEL), forking a supervisor
    /// that restarts crashed workers.
    #[arg(short = 'z', value_name = "LEVEL", num_args = 0..=1, default_missing_value = "0")]
    failsafe: Option<u32>,

    /// TOML tunables file overriding the cache/timing constants (ambient
    /// configuration surface, not part of the original CLI).
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of worker processes to run under failsafe supervision.
    #[arg(default_value_t = 1)]
    ncopies: usize,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    install_tracing(&cli.debug);

    if let Some(level) = cli.failsafe {
        // Forking must happen before any tokio runtime exists. The parent
        // never returns from `run`; only a child falls through here.
        if !rnfsd::failsafe::run(level, cli.ncopies.max(1)) {
            unreachable!("failsafe::run only returns in the forked child");
        }
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    if !cli.foreground {
        daemonize()?;
    }

    let tunables = Tunables::load(cli.config.as_deref())?;
    let server = build_server(&cli, &tunables)?;

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(serve(server, &cli))
}

/// Detaches from the controlling terminal unless `-F` was given (spec §6:
/// "-F foreground"). Thin wrapper over `daemon(3)`, as the original server
/// itself uses, rather than a hand-rolled fork/setsid/redirect sequence.
fn daemonize() -> std::io::Result<()> {
    // nochdir=0: chdir to "/"; noclose=0: redirect stdin/stdout/stderr to /dev/null.
    if unsafe { libc::daemon(0, 0) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn build_server(cli: &Cli, tunables: &Tunables) -> Result<Server, Box<dyn std::error::Error>> {
    let (lines, export_list) = config::load_exports(&cli.exports_file)?;

    let mut export_db = ExportDb::new();
    let mut export_roots = Vec::new();
    let mut public_root = cli.public_root.clone();

    for line in &lines {
        if line.is_public {
            continue;
        }
        export_roots.push(line.root.clone());
        let root = line.root.to_string_lossy().into_owned();
        for (pattern, opts) in &line.entries {
            export_db.add_export(pattern, root.clone(), opts.clone());
            if cli.promiscuous && !matches!(pattern, Pattern::Default) {
                export_db.add_export(&Pattern::Default, root.clone(), opts.clone());
            }
        }
    }

    let devtable_path = std::env::var_os("RNFSD_DEVTAB").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/etc/rnfsd.devtab"));
    let devtable = DeviceTable::open(devtable_path)?;

    let rmtab_path = std::env::var_os("RNFSD_RMTAB").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/etc/rmtab"));
    let rmtab = RemoteMountLog::open(rmtab_path)?;

    let mut server = Server::new(export_db, export_roots.clone(), devtable, rmtab, tunables);
    server.cache.set_fh_limit(tunables.fh_limit);
    server.cache.set_intervals(tunables.discard_interval(), tunables.close_interval());
    server.public_root = public_root.take();
    server.waive_secure_port = cli.waive_secure_port;
    server.promiscuous = cli.promiscuous;
    server.allow_reexport = cli.allow_reexport;
    server.cross_mount = !cli.disable_cross_mount;
    server.suppress_spoof_warnings = cli.suppress_spoof_warnings;
    server.log_transfers = cli.log_transfers;
    server.export_list = export_list;
    server.authorizer = rnfsd::auth::Authorizer::new(rnfsd::auth::SecurityPolicy { waive_secure_port: cli.waive_secure_port });

    Ok(server)
}

async fn serve(server: Server, cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cli.port));
    let socket = dispatcher::bind(addr).await?;
    tracing::info!(%addr, "rnfsd listening");

    let signals = Arc::new(Signals::default());
    install_signal_tasks(Arc::clone(&signals));

    let exports_file = cli.exports_file.clone();
    let promiscuous = cli.promiscuous;
    let on_reload = Box::new(move |server: &mut Server| match config::load_exports(&exports_file) {
        Ok((lines, export_list)) => {
            let mut export_db = ExportDb::new();
            let mut export_roots = Vec::new();
            for line in &lines {
                if line.is_public {
                    continue;
                }
                export_roots.push(line.root.clone());
                let root = line.root.to_string_lossy().into_owned();
                for (pattern, opts) in &line.entries {
                    export_db.add_export(pattern, root.clone(), opts.clone());
                    if promiscuous && !matches!(pattern, Pattern::Default) {
                        export_db.add_export(&Pattern::Default, root.clone(), opts.clone());
                    }
                }
            }
            server.export_db = export_db;
            server.export_roots = export_roots;
            server.export_list = export_list;
            tracing::info!("exports file reloaded");
        }
        Err(err) => tracing::error!(error = %err, "failed to reload exports file, keeping previous configuration"),
    });
    let on_debug_toggle = Box::new(|| {
        tracing::info!("toggling debug logging");
    });

    let mut dispatcher = Dispatcher::new(server, socket, signals, on_reload, on_debug_toggle);
    dispatcher.run().await?;
    Ok(())
}

/// Installs `tokio::signal` tasks translating `SIGHUP`/`SIGUSR1`/`SIGALRM`/
/// `SIGTERM` into the deferred [`Signals`] flags the dispatcher consults at
/// request boundaries (spec §5 "Signals").
fn install_signal_tasks(signals: Arc<Signals>) {
    use tokio::signal::unix::{signal, SignalKind};

    let s = Arc::clone(&signals);
    tokio::spawn(async move {
        let Ok(mut hup) = signal(SignalKind::hangup()) else { return };
        loop {
            hup.recv().await;
            s.request_reload();
        }
    });

    let s = Arc::clone(&signals);
    tokio::spawn(async move {
        let Ok(mut usr1) = signal(SignalKind::user_defined1()) else { return };
        loop {
            usr1.recv().await;
            s.request_debug_toggle();
        }
    });

    let s = Arc::clone(&signals);
    tokio::spawn(async move {
        let Ok(mut alrm) = signal(SignalKind::alarm()) else { return };
        loop {
            alrm.recv().await;
            s.request_flush();
        }
    });

    let s = Arc::clone(&signals);
    tokio::spawn(async move {
        let Ok(mut term) = signal(SignalKind::terminate()) else { return };
        term.recv().await;
        s.request_terminate();
    });
}

/// Builds an `EnvFilter` raising the facilities named by `-d` to `debug`
/// (spec §6's "all" enables every one), honoring `RUST_LOG` as an override
/// on top (SPEC_FULL.md "Ambient stack / Logging").
fn install_tracing(debug: &[String]) {
    use tracing_subscriber::EnvFilter;

    let mut filter = EnvFilter::new("info");
    let facilities: Vec<&str> = if debug.iter().any(|d| d == "all") { FACILITIES.to_vec() } else { debug.iter().map(String::as_str).collect() };
    for facility in facilities {
        filter = filter.add_directive(format!("rnfsd::{facility}=debug").parse().expect("facility name yields a valid directive"));
    }
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        for directive in rust_log.split(',') {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
