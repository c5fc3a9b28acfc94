use crate::tm::asyncutil::tasks;
use crate::tm::instance::{should_autorestart, ProcState};
use crate::tm::logger::tm_event;
use crate::tm::manager::JobManager;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

pub const MONITOR_INTERVAL: Duration = Duration::from_millis(300);

/// Run the monitor until shutdown completes: every instance terminal after
/// the shutdown flag is set.
pub fn spawn_monitor(mgr: Arc<JobManager>) -> JoinHandle<()> {
    tasks().spawn(async move {
        loop {
            tick(&mgr);
            if mgr.is_shutting_down() && mgr.all_terminal() {
                break;
            }
            tokio::time::sleep(MONITOR_INTERVAL).await;
        }
        tm_event("monitor", None, "outcome=stopped all_terminal=true");
    })
}

/// Non-blocking reap. `None` while alive; exit code on exit, `-signo` on a
/// signal death.
fn try_reap(pid: i32) -> Option<i32> {
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => Some(code),
        Ok(WaitStatus::Signaled(_, sig, _)) => Some(-(sig as i32)),
        Ok(_) => None,
        // Reaped elsewhere; the exit status is lost. Treat like a signal
        // death so the restart policy sees it as unexpected.
        Err(_) => Some(-1),
    }
}

/// One monitor pass: reconcile every instance with its OS process and the
/// declared policy. State is inspected and transitioned under the registry
/// lock; respawns and SIGKILLs run after it is released.
pub fn tick(mgr: &JobManager) {
    let shutting = mgr.is_shutting_down();
    let mut respawns: Vec<(String, usize, u64)> = Vec::new();
    let mut kills: Vec<(String, i32)> = Vec::new();

    {
        let mut reg = mgr.lock();
        let now = Instant::now();
        for (name, list) in reg.iter_mut() {
            for (index, inst) in list.iter_mut().enumerate() {
                if inst.state.is_live() && inst.pid > 0 {
                    if let Some(code) = try_reap(inst.pid) {
                        inst.last_exit_code = Some(code);
                        let ident = inst.ident();
                        match inst.state {
                            ProcState::Stopping => {
                                inst.clear_process();
                                inst.state = ProcState::Stopped;
                                tm_event(
                                    "monitor",
                                    Some(&ident),
                                    format!("event=exit exit_code={code} outcome=stopped"),
                                );
                            }
                            ProcState::Starting | ProcState::Running => {
                                // An exit while STARTING but past the start
                                // deadline means the process survived its
                                // start window; only a pre-deadline exit that
                                // the policy would restart is a failed start.
                                let survived_start = inst.state == ProcState::Running
                                    || inst.start_deadline.is_some_and(|d| now >= d);
                                inst.clear_process();
                                if !should_autorestart(&inst.program, code) || shutting {
                                    inst.state = ProcState::Exited;
                                    tm_event(
                                        "monitor",
                                        Some(&ident),
                                        format!("event=exit exit_code={code} outcome=exited"),
                                    );
                                } else if survived_start {
                                    inst.arm_spawn(true);
                                    respawns.push((name.clone(), index, inst.epoch));
                                    tm_event(
                                        "monitor",
                                        Some(&ident),
                                        format!("event=exit exit_code={code} decision=restart"),
                                    );
                                } else {
                                    inst.retries_remaining =
                                        inst.retries_remaining.saturating_sub(1);
                                    inst.state = ProcState::Backoff;
                                    tm_event(
                                        "monitor",
                                        Some(&ident),
                                        format!(
                                            "event=exit exit_code={code} outcome=backoff retries_remaining={}",
                                            inst.retries_remaining
                                        ),
                                    );
                                }
                            }
                            _ => {}
                        }
                        continue;
                    }

                    // Still alive: deadline checks.
                    match inst.state {
                        ProcState::Starting => {
                            if inst.start_deadline.is_some_and(|d| now >= d) {
                                inst.state = ProcState::Running;
                                tm_event(
                                    "monitor",
                                    Some(&inst.ident()),
                                    format!("outcome=running pid={}", inst.pid),
                                );
                            }
                        }
                        ProcState::Stopping => {
                            if !inst.kill_sent && inst.stop_deadline.is_some_and(|d| now >= d) {
                                inst.kill_sent = true;
                                kills.push((inst.ident(), inst.pid));
                            }
                        }
                        _ => {}
                    }
                } else if inst.state == ProcState::Backoff {
                    if shutting {
                        inst.clear_process();
                        inst.state = ProcState::Stopped;
                    } else if inst.retries_remaining > 0 {
                        inst.arm_spawn(false);
                        respawns.push((name.clone(), index, inst.epoch));
                    } else {
                        inst.state = ProcState::Fatal;
                        tm_event(
                            "monitor",
                            Some(&inst.ident()),
                            "outcome=fatal reason=start_retries_exhausted",
                        );
                    }
                }
            }
        }
    }

    for (ident, pid) in kills {
        tm_event(
            "monitor",
            Some(&ident),
            format!("event=stop_deadline decision=kill pgid={pid}"),
        );
        let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
    }
    for (name, index, epoch) in respawns {
        // Failures mark the instance FATAL and are already logged.
        let _ = mgr.spawn_instance(&name, index, epoch);
    }
}
