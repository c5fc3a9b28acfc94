use crate::tm::config::{Autorestart, Program};
use std::fs::File;
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle state of one managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Never started, or cleanly stopped; no process.
    Stopped,
    /// Process spawned; has not yet stayed alive for `starttime`.
    Starting,
    /// Alive and past its successful-start deadline.
    Running,
    /// Stop signal sent; awaiting exit or the force-kill deadline.
    Stopping,
    /// Last start attempt failed; awaiting retry.
    Backoff,
    /// Ran past the start deadline, then exited; no restart scheduled.
    Exited,
    /// Retries exhausted or unrecoverable spawn error; needs an operator.
    Fatal,
}

impl ProcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcState::Stopped => "STOPPED",
            ProcState::Starting => "STARTING",
            ProcState::Running => "RUNNING",
            ProcState::Stopping => "STOPPING",
            ProcState::Backoff => "BACKOFF",
            ProcState::Exited => "EXITED",
            ProcState::Fatal => "FATAL",
        }
    }

    /// States with an associated live OS process.
    pub fn is_live(&self) -> bool {
        matches!(self, ProcState::Starting | ProcState::Running | ProcState::Stopping)
    }

    /// States the shutdown path waits for.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcState::Stopped | ProcState::Exited | ProcState::Fatal)
    }
}

impl std::fmt::Display for ProcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One managed child: `(program, index)` plus all mutable supervision state.
///
/// Mutated only under the Job Manager lock. The log handles are open exactly
/// while a process is live; `clear_process` releases them before the state
/// field leaves a live state.
#[derive(Debug)]
pub struct Instance {
    pub program: Arc<Program>,
    pub index: u32,
    pub state: ProcState,
    /// 0 when no process is associated.
    pub pid: i32,
    /// Wall-clock of the most recent spawn attempt.
    pub started_at: Option<Instant>,
    /// started_at + starttime.
    pub start_deadline: Option<Instant>,
    /// Set when a stop is issued; SIGKILL once it passes.
    pub stop_deadline: Option<Instant>,
    /// SIGKILL already escalated for the current stop.
    pub kill_sent: bool,
    pub retries_remaining: u32,
    /// Negative values are signal deaths (-signo).
    pub last_exit_code: Option<i32>,
    pub stdout_log: Option<File>,
    pub stderr_log: Option<File>,
    /// Bumped on every commanded transition; an in-flight spawn whose epoch
    /// no longer matches must discard its child.
    pub epoch: u64,
}

impl Instance {
    pub fn new(program: Arc<Program>, index: u32) -> Self {
        let retries = program.startretries;
        Self {
            program,
            index,
            state: ProcState::Stopped,
            pid: 0,
            started_at: None,
            start_deadline: None,
            stop_deadline: None,
            kill_sent: false,
            retries_remaining: retries,
            last_exit_code: None,
            stdout_log: None,
            stderr_log: None,
            epoch: 0,
        }
    }

    pub fn ident(&self) -> String {
        format!("{}:{}", self.program.name, self.index)
    }

    pub fn uptime_secs(&self, now: Instant) -> u64 {
        if self.state != ProcState::Running {
            return 0;
        }
        self.started_at
            .map(|t| now.saturating_duration_since(t).as_secs())
            .unwrap_or(0)
    }

    /// Prepare a spawn attempt: the caller performs the actual spawn outside
    /// the registry lock and records the pid via the matching epoch.
    pub fn arm_spawn(&mut self, reset_retries: bool) {
        if reset_retries {
            self.retries_remaining = self.program.startretries;
        }
        let now = Instant::now();
        self.state = ProcState::Starting;
        self.pid = 0;
        self.started_at = Some(now);
        self.start_deadline = Some(now + self.program.starttime);
        self.stop_deadline = None;
        self.kill_sent = false;
        self.epoch += 1;
    }

    /// Release process bookkeeping. Must run before the state field moves to
    /// a non-live state so the no-process invariant holds.
    pub fn clear_process(&mut self) {
        self.pid = 0;
        self.stdout_log = None;
        self.stderr_log = None;
        self.stop_deadline = None;
        self.kill_sent = false;
    }
}

/// Restart decision for an observed exit. `code < 0` encodes a signal death,
/// which is always unexpected under `autorestart: unexpected`.
pub fn should_autorestart(program: &Program, code: i32) -> bool {
    match program.autorestart {
        Autorestart::Always => true,
        Autorestart::Never => false,
        Autorestart::Unexpected => code < 0 || !program.exitcodes.contains(&code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tm::config::policy_from_str;

    fn program(autorestart: &str, exitcodes: &str) -> Arc<Program> {
        let yaml = format!(
            "programs:\n  t:\n    cmd: /bin/true\n    autorestart: {autorestart}\n    exitcodes: {exitcodes}\n"
        );
        policy_from_str(&yaml).unwrap().programs.remove("t").unwrap()
    }

    #[test]
    fn restart_decision_table() {
        let always = program("always", "[0]");
        let never = program("never", "[0]");
        let unexpected = program("unexpected", "[0, 2]");

        assert!(should_autorestart(&always, 0));
        assert!(should_autorestart(&always, 1));
        assert!(should_autorestart(&always, -9));

        assert!(!should_autorestart(&never, 0));
        assert!(!should_autorestart(&never, 1));
        assert!(!should_autorestart(&never, -9));

        assert!(!should_autorestart(&unexpected, 0));
        assert!(!should_autorestart(&unexpected, 2));
        assert!(should_autorestart(&unexpected, 1));
        // Signal deaths are unexpected even when the signal number appears
        // in exitcodes.
        let with_nine = program("unexpected", "[0, 9]");
        assert!(should_autorestart(&with_nine, -9));
    }

    #[test]
    fn arm_spawn_sets_deadlines_and_epoch() {
        let p = program("always", "[0]");
        let mut inst = Instance::new(p, 0);
        inst.retries_remaining = 1;
        let epoch0 = inst.epoch;

        inst.arm_spawn(false);
        assert_eq!(inst.state, ProcState::Starting);
        assert_eq!(inst.pid, 0);
        assert_eq!(inst.retries_remaining, 1);
        assert_eq!(inst.epoch, epoch0 + 1);
        assert!(inst.start_deadline.unwrap() >= inst.started_at.unwrap());

        inst.arm_spawn(true);
        assert_eq!(inst.retries_remaining, inst.program.startretries);
    }

    #[test]
    fn clear_process_releases_handles() {
        let p = program("never", "[0]");
        let mut inst = Instance::new(p, 0);
        inst.pid = 1234;
        inst.stop_deadline = Some(Instant::now());
        inst.kill_sent = true;
        inst.clear_process();
        assert_eq!(inst.pid, 0);
        assert!(inst.stdout_log.is_none());
        assert!(inst.stderr_log.is_none());
        assert!(inst.stop_deadline.is_none());
        assert!(!inst.kill_sent);
    }

    #[test]
    fn uptime_is_zero_unless_running() {
        let p = program("never", "[0]");
        let mut inst = Instance::new(p, 0);
        let now = Instant::now();
        inst.started_at = Some(now);
        inst.state = ProcState::Starting;
        assert_eq!(inst.uptime_secs(now), 0);
        inst.state = ProcState::Running;
        assert_eq!(inst.uptime_secs(now + std::time::Duration::from_secs(5)), 5);
    }

    #[test]
    fn state_labels() {
        assert_eq!(ProcState::Backoff.as_str(), "BACKOFF");
        assert_eq!(ProcState::Running.to_string(), "RUNNING");
        assert!(ProcState::Stopping.is_live());
        assert!(!ProcState::Backoff.is_live());
        assert!(ProcState::Fatal.is_terminal());
        assert!(!ProcState::Backoff.is_terminal());
    }
}
