//! Failsafe supervisor (spec §5 "Failsafe mode"): forks `ncopies` worker
//! processes and restarts whichever one dies abnormally, backing off when
//! restarts happen in a tight loop.
//!
//! Ported line-for-line from `failsafe.c`'s `failsafe()`: the same
//! `last_restart`/`restarts`/`backoff` state machine, the same
//! abnormal-vs-normal-exit classification (a clean `WIFEXITED` or a
//! `SIGTERM`-signaled death does not restart; any other signal or an
//! unrecognized wait status does), and the same slot-shrinking once a
//! worker is allowed to exit for good. The restart-policy decisions are
//! pulled out into free functions so they're testable without forking a
//! real process per test case.

use std::time::Duration;

use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

/// Initial and post-reset backoff, in seconds (`failsafe.c`: `backoff = 60`).
const INITIAL_BACKOFF_SECS: u64 = 60;
/// Ceiling the backoff stops doubling past (`failsafe.c`: `backoff < 60*60`).
const MAX_BACKOFF_SECS: u64 = 60 * 60;

/// Whether a child's death should be followed by starting a replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Restart,
    LetItGo,
}

/// Classifies one `waitpid` result (`failsafe.c`'s `WIFSIGNALED`/
/// `WIFEXITED`/else chain). A `SIGTERM`-signaled or cleanly exited child is
/// not restarted; anything else (killed by another signal, or a status
/// this platform's wait doesn't recognize as either) is.
fn classify(status: &WaitStatus) -> Disposition {
    match status {
        WaitStatus::Exited(..) => Disposition::LetItGo,
        WaitStatus::Signaled(_, Signal::SIGTERM, _) => Disposition::LetItGo,
        _ => Disposition::Restart,
    }
}

/// One step of the restart/backoff bookkeeping run just before starting a
/// replacement server (`failsafe.c`'s `if ((now = time(NULL)) ==
/// last_restart) { ... } else { ... }`). Returns the (possibly unchanged)
/// state and how long to sleep before forking, if the restart rate
/// tripped the `2*ncopies`-per-second threshold.
fn step_backoff(last_restart: i64, now: i64, restarts: u32, backoff: u64, ncopies: usize) -> (i64, u32, u64, Option<Duration>) {
    if now == last_restart {
        let restarts = restarts + 1;
        if restarts as usize > 2 * ncopies {
            let backoff = if backoff < MAX_BACKOFF_SECS { backoff * 2 } else { backoff };
            return (last_restart, restarts, backoff, Some(Duration::from_secs(backoff)));
        }
        (last_restart, restarts, backoff, None)
    } else {
        (now, 0, INITIAL_BACKOFF_SECS, None)
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn ignore_supervisor_signals() {
    for sig in [Signal::SIGTERM, Signal::SIGHUP, Signal::SIGINT, Signal::SIGCHLD] {
        // Safety: installs SIG_IGN, which never runs user code and cannot
        // itself be unsafe to call from this context.
        let _ = unsafe { signal::signal(sig, SigHandler::SigIgn) };
    }
}

/// Runs the supervisor loop. Returns only inside a forked child — the
/// caller is expected to fall through into the normal server startup path
/// immediately afterward (`failsafe.c`: "Child process: continue with
/// execution."). The parent never returns: it loops until every worker
/// has exited normally, then calls `std::process::exit(0)`.
///
/// `level` mirrors `failsafe()`'s `level` argument, reserved for a
/// fail-safe core-dump session the original never finished either
/// (`failsafe_loop`'s body is a literal no-op there).
pub fn run(level: u32, ncopies: usize) -> bool {
    tracing::debug!(level, ncopies, "failsafe supervisor starting");

    let mut servers: Vec<Pid> = vec![Pid::from_raw(0); ncopies];
    let mut ncopies = ncopies;
    let mut running = 0usize;
    let mut last_restart = 0i64;
    let mut restarts = 0u32;
    let mut backoff = INITIAL_BACKOFF_SECS;

    loop {
        while running < ncopies {
            let now = now_secs();
            let (new_last_restart, new_restarts, new_backoff, sleep_for) = step_backoff(last_restart, now, restarts, backoff, ncopies);
            last_restart = new_last_restart;
            restarts = new_restarts;
            backoff = new_backoff;
            if let Some(duration) = sleep_for {
                tracing::error!(backoff_secs = duration.as_secs(), "servers restarting too quickly, backing off");
                std::thread::sleep(duration);
            }

            let Some(slot) = servers.iter().position(|&pid| pid == Pid::from_raw(0)) else {
                tracing::error!("failsafe: no free pid slot");
                std::process::exit(1);
            };

            match unsafe { fork() } {
                Ok(ForkResult::Child) => return true,
                Ok(ForkResult::Parent { child }) => {
                    tracing::debug!(slot, pid = child.as_raw(), "failsafe: started server");
                    servers[slot] = child;
                    running += 1;
                }
                Err(err) => {
                    tracing::error!(error = %err, "failsafe: fork failed");
                    std::process::exit(1);
                }
            }
        }

        ignore_supervisor_signals();

        let status = match waitpid(None, None) {
            Ok(status) => status,
            Err(nix::errno::Errno::ECHILD) => {
                tracing::error!("failsafe: wait() found no children");
                std::process::exit(1);
            }
            Err(err) => {
                tracing::warn!(error = %err, "failsafe: wait() failed");
                continue;
            }
        };

        let pid = match status.pid() {
            Some(pid) => pid,
            None => continue,
        };
        let disposition = classify(&status);
        tracing::info!(pid = pid.as_raw(), ?status, ?disposition, "failsafe: child terminated");

        let Some(slot) = servers.iter().position(|&p| p == pid) else {
            tracing::warn!(pid = pid.as_raw(), "failsafe: unknown child terminated");
            continue;
        };
        servers[slot] = Pid::from_raw(0);
        running -= 1;

        if disposition == Disposition::LetItGo {
            if running == 0 {
                tracing::info!("failsafe: no more children, exiting");
                std::process::exit(0);
            }
            servers.remove(slot);
            ncopies -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigterm_and_clean_exit_do_not_restart() {
        assert_eq!(classify(&WaitStatus::Exited(Pid::from_raw(1), 0)), Disposition::LetItGo);
        assert_eq!(classify(&WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGTERM, false)), Disposition::LetItGo);
    }

    #[test]
    fn other_signals_restart() {
        assert_eq!(classify(&WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGSEGV, true)), Disposition::Restart);
        assert_eq!(classify(&WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false)), Disposition::Restart);
    }

    #[test]
    fn backoff_resets_on_a_new_wall_clock_second() {
        let (last, restarts, backoff, sleep_for) = step_backoff(100, 101, 5, 480, 2);
        assert_eq!(last, 101);
        assert_eq!(restarts, 0);
        assert_eq!(backoff, INITIAL_BACKOFF_SECS);
        assert!(sleep_for.is_none());
    }

    #[test]
    fn backoff_doubles_once_the_threshold_is_crossed_within_one_second() {
        // ncopies=2 => threshold is restarts > 4.
        let (last, restarts, backoff, sleep_for) = step_backoff(100, 100, 4, 60, 2);
        assert_eq!(last, 100);
        assert_eq!(restarts, 5);
        assert_eq!(backoff, 120);
        assert_eq!(sleep_for, Some(Duration::from_secs(120)));
    }

    #[test]
    fn backoff_does_not_exceed_one_hour() {
        let (_, _, backoff, sleep_for) = step_backoff(100, 100, 9999, MAX_BACKOFF_SECS, 1);
        assert_eq!(backoff, MAX_BACKOFF_SECS);
        assert_eq!(sleep_for, Some(Duration::from_secs(MAX_BACKOFF_SECS)));
    }

    #[test]
    fn under_threshold_restarts_silently_without_sleeping() {
        let (_, restarts, backoff, sleep_for) = step_backoff(100, 100, 0, 60, 10);
        assert_eq!(restarts, 1);
        assert_eq!(backoff, 60);
        assert!(sleep_for.is_none());
    }
}
