use crate::tm::asyncutil::tasks;
use crate::tm::config::{self, Policy, Program};
use crate::tm::instance::{Instance, ProcState};
use crate::tm::logger::tm_event;
use anyhow::Context as _;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Extra window after the stop grace period for SIGKILL to take effect and
/// be reaped.
const KILL_SETTLE: Duration = Duration::from_secs(3);

/// Per-instance outcome of a start command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    /// Refused: a stop is in flight for this instance.
    Busy,
    /// Spawn failed; the instance is FATAL.
    FatalUnreachable(String),
}

impl std::fmt::Display for StartOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartOutcome::Started => f.write_str("started"),
            StartOutcome::AlreadyRunning => f.write_str("already-running"),
            StartOutcome::Busy => f.write_str("busy: stop in progress"),
            StartOutcome::FatalUnreachable(e) => write!(f, "fatal-unreachable: {e}"),
        }
    }
}

/// Per-instance outcome of a stop command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopping,
    AlreadyStopped,
}

impl std::fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopOutcome::Stopping => f.write_str("stopping"),
            StopOutcome::AlreadyStopped => f.write_str("already-stopped"),
        }
    }
}

/// One row of the status snapshot, also the `/api/status` payload shape.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub name: String,
    pub state: String,
    pub pid: i32,
    pub uptime: u64,
    pub last_exit_code: Option<i32>,
    pub retries_remaining: u32,
}

/// Registry of all managed instances. One lock covers the whole registry;
/// critical sections only inspect and transition state. Process spawn,
/// signal delivery and file opens run outside the lock against instances
/// pinned by the registry.
pub struct JobManager {
    pub(crate) policy: Policy,
    pub(crate) registry: Mutex<BTreeMap<String, Vec<Instance>>>,
    pub(crate) shutting_down: Arc<AtomicBool>,
}

/// Parse `name` or `name:index`.
pub fn parse_target(target: &str) -> anyhow::Result<(String, Option<u32>)> {
    let t = target.trim();
    anyhow::ensure!(!t.is_empty(), "empty target");
    match t.split_once(':') {
        None => Ok((t.to_string(), None)),
        Some((name, idx)) => {
            anyhow::ensure!(!name.is_empty(), "invalid target {t:?}");
            let i: u32 = idx
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid instance index in {t:?}"))?;
            Ok((name.to_string(), Some(i)))
        }
    }
}

fn select_indices(len: usize, idx: Option<u32>, target: &str) -> anyhow::Result<Vec<usize>> {
    match idx {
        Some(i) => {
            anyhow::ensure!((i as usize) < len, "unknown instance: {target}");
            Ok(vec![i as usize])
        }
        None => Ok((0..len).collect()),
    }
}

/// Deliver a signal to an instance's process group. A process that is
/// already gone counts as success; the reap path picks up the exit.
pub(crate) fn signal_group(ident: &str, pid: i32, sig: Signal) {
    match kill(Pid::from_raw(-pid), sig) {
        Ok(()) => tm_event(
            "stop",
            Some(ident),
            format!("attempt=signal sig={} pgid={pid} outcome=sent", sig.as_str()),
        ),
        Err(Errno::ESRCH) => tm_event(
            "stop",
            Some(ident),
            format!("attempt=signal sig={} pgid={pid} outcome=gone", sig.as_str()),
        ),
        Err(e) => {
            tm_event(
                "stop",
                Some(ident),
                format!(
                    "attempt=signal sig={} pgid={pid} outcome=error err={e} decision=kill",
                    sig.as_str()
                ),
            );
            let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
        }
    }
}

enum StartAction {
    Report(StartOutcome),
    Spawn { epoch: u64 },
}

impl JobManager {
    /// Build the registry: one STOPPED instance per program x index.
    pub fn new(policy: Policy, shutting_down: Arc<AtomicBool>) -> Self {
        let mut registry = BTreeMap::new();
        for (name, program) in &policy.programs {
            let list: Vec<Instance> = (0..program.numprocs)
                .map(|i| Instance::new(Arc::clone(program), i))
                .collect();
            registry.insert(name.clone(), list);
        }
        Self {
            policy,
            registry: Mutex::new(registry),
            shutting_down,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<Instance>>> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub fn max_stoptime(&self) -> Duration {
        self.policy.max_stoptime()
    }

    /// Issue start for every program flagged autostart.
    pub fn autostart(&self) {
        let names: Vec<String> = self
            .policy
            .programs
            .values()
            .filter(|p| p.autostart)
            .map(|p| p.name.clone())
            .collect();
        for name in names {
            match self.start(&name) {
                Ok(outcomes) => {
                    for (ident, o) in outcomes {
                        tm_event("autostart", Some(&ident), format!("outcome={o}"));
                    }
                }
                Err(e) => tm_event("autostart", Some(&name), format!("outcome=error err={e:#}")),
            }
        }
    }

    pub fn start(&self, target: &str) -> anyhow::Result<Vec<(String, StartOutcome)>> {
        let (name, idx) = parse_target(target)?;
        let mut plan: Vec<(usize, String, StartAction)> = Vec::new();
        {
            let mut reg = self.lock();
            let list = reg
                .get_mut(&name)
                .ok_or_else(|| anyhow::anyhow!("unknown program: {name}"))?;
            let indices = select_indices(list.len(), idx, target)?;
            for i in indices {
                let inst = &mut list[i];
                let ident = inst.ident();
                let action = match inst.state {
                    ProcState::Starting | ProcState::Running | ProcState::Backoff => {
                        StartAction::Report(StartOutcome::AlreadyRunning)
                    }
                    ProcState::Stopping => StartAction::Report(StartOutcome::Busy),
                    ProcState::Stopped | ProcState::Exited | ProcState::Fatal => {
                        inst.arm_spawn(true);
                        StartAction::Spawn { epoch: inst.epoch }
                    }
                };
                plan.push((i, ident, action));
            }
        }

        let mut out = Vec::with_capacity(plan.len());
        for (i, ident, action) in plan {
            match action {
                StartAction::Report(o) => out.push((ident, o)),
                StartAction::Spawn { epoch } => match self.spawn_instance(&name, i, epoch) {
                    Ok(()) => out.push((ident, StartOutcome::Started)),
                    Err(e) => out.push((ident, StartOutcome::FatalUnreachable(format!("{e:#}")))),
                },
            }
        }
        Ok(out)
    }

    /// Returns right after the stop signal is delivered; completion is
    /// observed via `status`.
    pub fn stop(&self, target: &str) -> anyhow::Result<Vec<(String, StopOutcome)>> {
        let (name, idx) = parse_target(target)?;
        let mut signals: Vec<(String, i32, Signal)> = Vec::new();
        let mut out = Vec::new();
        {
            let mut reg = self.lock();
            let list = reg
                .get_mut(&name)
                .ok_or_else(|| anyhow::anyhow!("unknown program: {name}"))?;
            let indices = select_indices(list.len(), idx, target)?;
            let now = Instant::now();
            for i in indices {
                let inst = &mut list[i];
                let ident = inst.ident();
                let outcome = match inst.state {
                    ProcState::Starting | ProcState::Running if inst.pid > 0 => {
                        inst.state = ProcState::Stopping;
                        inst.stop_deadline = Some(now + inst.program.stoptime);
                        inst.kill_sent = false;
                        signals.push((ident.clone(), inst.pid, inst.program.stopsignal));
                        StopOutcome::Stopping
                    }
                    ProcState::Starting => {
                        // Spawn still in flight: cancel it. The late child is
                        // discarded by the epoch check.
                        inst.epoch += 1;
                        inst.clear_process();
                        inst.state = ProcState::Stopped;
                        StopOutcome::Stopping
                    }
                    ProcState::Stopping => StopOutcome::Stopping,
                    ProcState::Backoff => {
                        // No process exists in BACKOFF; stop cancels the
                        // retry chain.
                        inst.epoch += 1;
                        inst.clear_process();
                        inst.state = ProcState::Stopped;
                        StopOutcome::AlreadyStopped
                    }
                    ProcState::Stopped
                    | ProcState::Exited
                    | ProcState::Fatal
                    | ProcState::Running => StopOutcome::AlreadyStopped,
                };
                out.push((ident, outcome));
            }
        }
        for (ident, pid, sig) in signals {
            signal_group(&ident, pid, sig);
        }
        Ok(out)
    }

    /// Stop, wait for the stop to complete (the monitor reaps and escalates),
    /// then start. Returns once the start has been issued.
    pub fn restart(&self, target: &str) -> anyhow::Result<Vec<(String, StartOutcome)>> {
        let (name, idx) = parse_target(target)?;
        self.stop(target)?;
        let stoptime = self
            .policy
            .programs
            .get(&name)
            .map(|p| p.stoptime)
            .unwrap_or_default();
        let deadline = Instant::now() + stoptime + KILL_SETTLE;
        loop {
            if self.selection_idle(&name, idx) {
                break;
            }
            anyhow::ensure!(
                Instant::now() < deadline,
                "{target}: still running after stop escalation"
            );
            std::thread::sleep(Duration::from_millis(50));
        }
        self.start(target)
    }

    fn selection_idle(&self, name: &str, idx: Option<u32>) -> bool {
        let reg = self.lock();
        let Some(list) = reg.get(name) else { return true };
        match idx {
            Some(i) => list
                .get(i as usize)
                .map(|inst| !inst.state.is_live())
                .unwrap_or(true),
            None => list.iter().all(|inst| !inst.state.is_live()),
        }
    }

    /// Snapshot of every instance, in registry order.
    pub fn status(&self) -> Vec<StatusEntry> {
        let reg = self.lock();
        let now = Instant::now();
        let mut out = Vec::new();
        for list in reg.values() {
            for inst in list {
                out.push(StatusEntry {
                    name: inst.ident(),
                    state: inst.state.as_str().to_string(),
                    pid: inst.pid,
                    uptime: inst.uptime_secs(now),
                    last_exit_code: inst.last_exit_code,
                    retries_remaining: inst.retries_remaining,
                });
            }
        }
        out
    }

    /// Broadcast stop to every non-terminal instance and set the shutdown
    /// flag; the monitor finishes the rest. Safe to call more than once.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let mut signals: Vec<(String, i32, Signal)> = Vec::new();
        {
            let mut reg = self.lock();
            let now = Instant::now();
            for list in reg.values_mut() {
                for inst in list.iter_mut() {
                    match inst.state {
                        ProcState::Starting | ProcState::Running if inst.pid > 0 => {
                            inst.state = ProcState::Stopping;
                            inst.stop_deadline = Some(now + inst.program.stoptime);
                            inst.kill_sent = false;
                            signals.push((inst.ident(), inst.pid, inst.program.stopsignal));
                        }
                        ProcState::Starting | ProcState::Backoff => {
                            inst.epoch += 1;
                            inst.clear_process();
                            inst.state = ProcState::Stopped;
                        }
                        _ => {}
                    }
                }
            }
        }
        for (ident, pid, sig) in signals {
            signal_group(&ident, pid, sig);
        }
    }

    /// Escalation path for a second shutdown signal: SIGKILL every live
    /// process group immediately.
    pub fn kill_all(&self) {
        let victims: Vec<(String, i32)> = {
            let reg = self.lock();
            reg.values()
                .flatten()
                .filter(|inst| inst.state.is_live() && inst.pid > 0)
                .map(|inst| (inst.ident(), inst.pid))
                .collect()
        };
        for (ident, pid) in victims {
            tm_event("shutdown", Some(&ident), format!("attempt=kill pgid={pid}"));
            let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
        }
    }

    pub fn all_terminal(&self) -> bool {
        let reg = self.lock();
        reg.values().flatten().all(|inst| inst.state.is_terminal())
    }

    /// Finish a spawn armed under the lock: run the expensive part (log file
    /// opens, fork/exec) unlocked, then record the result if the instance's
    /// epoch still matches.
    pub(crate) fn spawn_instance(&self, name: &str, index: usize, epoch: u64) -> anyhow::Result<()> {
        let program = Arc::clone(
            self.policy
                .programs
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("unknown program: {name}"))?,
        );
        let ident = format!("{name}:{index}");
        let spawned = spawn_child(&program);

        let mut orphan: Option<i32> = None;
        let result = {
            let mut reg = self.lock();
            let inst = reg
                .get_mut(name)
                .and_then(|l| l.get_mut(index))
                .ok_or_else(|| anyhow::anyhow!("instance vanished: {ident}"))?;
            match spawned {
                Ok((pid, stdout_log, stderr_log)) => {
                    if inst.epoch == epoch && inst.state == ProcState::Starting && inst.pid == 0 {
                        inst.pid = pid;
                        inst.stdout_log = stdout_log;
                        inst.stderr_log = stderr_log;
                        tm_event(
                            "spawn",
                            Some(&ident),
                            format!(
                                "outcome=started pid={pid} retries_remaining={}",
                                inst.retries_remaining
                            ),
                        );
                    } else {
                        // A command intervened while the spawn was in
                        // flight; this child is not tracked.
                        orphan = Some(pid);
                    }
                    Ok(())
                }
                Err(e) => {
                    if inst.epoch == epoch {
                        inst.clear_process();
                        inst.state = ProcState::Fatal;
                        tm_event("spawn", Some(&ident), format!("outcome=fatal err={e:#}"));
                    }
                    Err(e)
                }
            }
        };

        if let Some(pid) = orphan {
            tm_event(
                "spawn",
                Some(&ident),
                format!("outcome=discarded pid={pid} superseded_while_spawning=true"),
            );
            let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
            tasks().spawn_blocking(move || {
                let _ = waitpid(Pid::from_raw(pid), None);
            });
        }
        result
    }
}

/// Fork/exec one child: own process group, configured umask, working
/// directory, merged environment, stdout/stderr appended to the configured
/// log paths (or /dev/null).
fn spawn_child(program: &Program) -> anyhow::Result<(i32, Option<File>, Option<File>)> {
    let argv = &program.argv;

    let stdout_log = match program.stdout_path.as_deref() {
        Some(p) => Some(config::open_append_log(p)?),
        None => None,
    };
    let stderr_log = match program.stderr_path.as_deref() {
        Some(p) => Some(config::open_append_log(p)?),
        None => None,
    };

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.stdin(Stdio::null());
    match &stdout_log {
        Some(f) => {
            cmd.stdout(Stdio::from(f.try_clone().context("dup stdout log fd")?));
        }
        None => {
            cmd.stdout(Stdio::null());
        }
    }
    match &stderr_log {
        Some(f) => {
            cmd.stderr(Stdio::from(f.try_clone().context("dup stderr log fd")?));
        }
        None => {
            cmd.stderr(Stdio::null());
        }
    }
    if let Some(wd) = program.workingdir.as_deref() {
        cmd.current_dir(wd);
    }
    cmd.envs(&program.env);

    // Own process group so stop signals reach the whole tree.
    let umask = program.umask;
    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            if let Some(m) = umask {
                nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(m));
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| {
        anyhow::anyhow!(
            "spawn argv={:?} failed: kind={:?} os_error={:?} err={e}",
            argv,
            e.kind(),
            e.raw_os_error()
        )
    })?;
    // The monitor reaps via waitpid; the Child handle itself is not needed.
    let pid = child.id() as i32;
    drop(child);
    Ok((pid, stdout_log, stderr_log))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tm::config::policy_from_str;

    fn manager(yaml: &str) -> JobManager {
        JobManager::new(
            policy_from_str(yaml).unwrap(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn parse_target_forms() {
        assert_eq!(parse_target("web").unwrap(), ("web".to_string(), None));
        assert_eq!(parse_target("web:2").unwrap(), ("web".to_string(), Some(2)));
        assert_eq!(parse_target(" web:0 ").unwrap(), ("web".to_string(), Some(0)));
        assert!(parse_target("").is_err());
        assert!(parse_target(":1").is_err());
        assert!(parse_target("web:x").is_err());
        assert!(parse_target("web:-1").is_err());
    }

    #[test]
    fn registry_has_one_instance_per_index() {
        let mgr = manager("programs:\n  w:\n    cmd: /bin/sleep 60\n    numprocs: 3\n");
        let rows = mgr.status();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].name, "w:0");
        assert_eq!(rows[2].name, "w:2");
        for r in rows {
            assert_eq!(r.state, "STOPPED");
            assert_eq!(r.pid, 0);
            assert_eq!(r.uptime, 0);
            assert_eq!(r.last_exit_code, None);
            assert_eq!(r.retries_remaining, 3);
        }
    }

    #[test]
    fn stop_on_stopped_is_a_noop() {
        let mgr = manager("programs:\n  w:\n    cmd: /bin/sleep 60\n    numprocs: 2\n");
        let out = mgr.stop("w").unwrap();
        assert_eq!(
            out,
            vec![
                ("w:0".to_string(), StopOutcome::AlreadyStopped),
                ("w:1".to_string(), StopOutcome::AlreadyStopped),
            ]
        );
    }

    #[test]
    fn unknown_targets_error() {
        let mgr = manager("programs:\n  w:\n    cmd: /bin/sleep 60\n");
        assert!(mgr.start("nope").is_err());
        assert!(mgr.stop("w:5").is_err());
        assert!(mgr.restart("nope:0").is_err());
    }

    #[test]
    fn outcome_rendering() {
        assert_eq!(StartOutcome::Started.to_string(), "started");
        assert_eq!(StartOutcome::AlreadyRunning.to_string(), "already-running");
        assert_eq!(StopOutcome::AlreadyStopped.to_string(), "already-stopped");
        assert!(StartOutcome::FatalUnreachable("no such file".into())
            .to_string()
            .starts_with("fatal-unreachable:"));
    }

    #[test]
    fn shutdown_flag_and_terminal_check() {
        let mgr = manager("programs:\n  w:\n    cmd: /bin/sleep 60\n");
        assert!(!mgr.is_shutting_down());
        assert!(mgr.all_terminal());
        mgr.begin_shutdown();
        assert!(mgr.is_shutting_down());
        assert!(mgr.all_terminal());
    }
}
