use anyhow::Context as _;
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// Bounds carried over from the policy validator: anything past these is
// almost certainly a typo rather than intent.
const MAX_NUMPROCS: u32 = 100;
const MAX_STARTRETRIES: u32 = 50;
const MAX_STOPTIME_SECS: f64 = 300.0;

/// Immutable supervision policy for one declared program.
///
/// Built once at startup from the YAML file and never mutated; every other
/// component holds an `Arc<Program>`.
#[derive(Debug)]
pub struct Program {
    pub name: String,
    /// Executable + arguments, split from the `cmd` string with shell-style
    /// quoting rules (no shell is invoked).
    pub argv: Vec<String>,
    pub numprocs: u32,
    pub workingdir: Option<PathBuf>,
    pub umask: Option<u32>,
    pub autostart: bool,
    pub autorestart: Autorestart,
    /// Exit codes considered an expected termination.
    pub exitcodes: BTreeSet<i32>,
    pub startretries: u32,
    /// How long a process must stay alive to count as successfully started.
    pub starttime: Duration,
    pub stopsignal: Signal,
    /// Grace window between the stop signal and SIGKILL escalation.
    pub stoptime: Duration,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    /// Merged over the parent environment at spawn time; program wins.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Autorestart {
    Always,
    Unexpected,
    Never,
}

/// The validated configuration: one `Program` per declared program.
#[derive(Debug)]
pub struct Policy {
    pub programs: BTreeMap<String, Arc<Program>>,
}

impl Policy {
    /// Largest configured stop grace window; bounds how long a full
    /// shutdown may wait before force-killing.
    pub fn max_stoptime(&self) -> Duration {
        self.programs
            .values()
            .map(|p| p.stoptime)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

// -------- YAML file schema (strict) --------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    programs: BTreeMap<String, ProgramSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProgramSection {
    cmd: String,
    #[serde(default = "default_numprocs")]
    numprocs: u32,
    #[serde(default)]
    workingdir: Option<PathBuf>,
    #[serde(default, deserialize_with = "deserialize_umask")]
    umask: Option<u32>,
    #[serde(default = "default_autostart")]
    autostart: bool,
    #[serde(default = "default_autorestart")]
    autorestart: Autorestart,
    #[serde(default = "default_exitcodes", deserialize_with = "deserialize_exitcodes")]
    exitcodes: Vec<i64>,
    #[serde(default = "default_startretries")]
    startretries: u32,
    #[serde(default = "default_starttime", deserialize_with = "deserialize_seconds")]
    starttime: f64,
    #[serde(default = "default_stopsignal")]
    stopsignal: String,
    #[serde(default = "default_stoptime", deserialize_with = "deserialize_seconds")]
    stoptime: f64,
    #[serde(default)]
    stdout: Option<PathBuf>,
    #[serde(default)]
    stderr: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

fn default_numprocs() -> u32 {
    1
}
fn default_autostart() -> bool {
    true
}
fn default_autorestart() -> Autorestart {
    Autorestart::Unexpected
}
fn default_exitcodes() -> Vec<i64> {
    vec![0]
}
fn default_startretries() -> u32 {
    3
}
fn default_starttime() -> f64 {
    1.0
}
fn default_stopsignal() -> String {
    "TERM".to_string()
}
fn default_stoptime() -> f64 {
    10.0
}

/// Accept `umask: 022` (int) or `umask: "022"` / `"0o22"` (octal string).
fn deserialize_umask<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    let Some(v) = v else { return Ok(None) };
    match v {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .map(|x| Some(x as u32))
            .ok_or_else(|| D::Error::custom("umask must be a non-negative integer or octal string")),
        serde_yaml::Value::String(s) => parse_octal_str(&s).map(Some).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "umask must be an integer or octal string (e.g. \"022\")",
        )),
    }
}

fn parse_octal_str(s: &str) -> Result<u32, String> {
    let t = s.trim();
    let t = t.strip_prefix("0o").unwrap_or(t);
    let t = t.strip_prefix("0O").unwrap_or(t);
    u32::from_str_radix(t, 8).map_err(|e| format!("invalid octal value {s:?}: {e}"))
}

/// Accept `exitcodes: 0` (scalar) or `exitcodes: [0, 2]` (list).
fn deserialize_exitcodes<'de, D>(deserializer: D) -> Result<Vec<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Number(n) => {
            let c = n
                .as_i64()
                .ok_or_else(|| D::Error::custom("exit code must be an integer"))?;
            Ok(vec![c])
        }
        serde_yaml::Value::Sequence(seq) => seq
            .into_iter()
            .map(|x| {
                x.as_i64()
                    .ok_or_else(|| D::Error::custom("exit codes must be integers"))
            })
            .collect(),
        _ => Err(D::Error::custom(
            "exitcodes must be an integer or a list of integers",
        )),
    }
}

/// Numeric durations are seconds: integer or float.
fn deserialize_seconds<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| D::Error::custom("duration must be a number of seconds")),
        _ => Err(D::Error::custom(
            "duration must be a number of seconds (integer or float)",
        )),
    }
}

/// Resolve a symbolic POSIX signal name (with or without the `SIG` prefix).
pub fn parse_signal(s: &str) -> anyhow::Result<Signal> {
    let raw = s.trim().to_uppercase();
    let name = raw.strip_prefix("SIG").unwrap_or(&raw);
    let sig = match name {
        "TERM" => Signal::SIGTERM,
        "INT" => Signal::SIGINT,
        "QUIT" => Signal::SIGQUIT,
        "KILL" => Signal::SIGKILL,
        "HUP" => Signal::SIGHUP,
        "USR1" => Signal::SIGUSR1,
        "USR2" => Signal::SIGUSR2,
        "ABRT" => Signal::SIGABRT,
        _ => anyhow::bail!("unsupported stopsignal: {s}"),
    };
    Ok(sig)
}

/// Open a log target the way children will get it: append, created 0644 if
/// absent (subject to the process umask).
pub fn open_append_log(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }
    }
    let f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o644)
        .open(path)
        .with_context(|| format!("open log {}", path.display()))?;
    Ok(f)
}

fn valid_program_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl ProgramSection {
    fn into_program(self, name: &str) -> anyhow::Result<Program> {
        anyhow::ensure!(
            valid_program_name(name),
            "invalid program name {name:?} (allowed: letters, digits, underscore, hyphen)"
        );

        let cmd = self.cmd.trim();
        anyhow::ensure!(!cmd.is_empty(), "program {name}: cmd must not be empty");
        let argv = shell_words::split(cmd)
            .map_err(|e| anyhow::anyhow!("program {name}: failed to parse cmd: {e}"))?;
        anyhow::ensure!(!argv.is_empty(), "program {name}: cmd has no words");

        anyhow::ensure!(
            (1..=MAX_NUMPROCS).contains(&self.numprocs),
            "program {name}: numprocs must be in 1..={MAX_NUMPROCS} (got {})",
            self.numprocs
        );
        anyhow::ensure!(
            self.startretries <= MAX_STARTRETRIES,
            "program {name}: startretries must be <= {MAX_STARTRETRIES} (got {})",
            self.startretries
        );
        anyhow::ensure!(
            self.starttime >= 0.0,
            "program {name}: starttime must be >= 0"
        );
        anyhow::ensure!(
            (0.0..=MAX_STOPTIME_SECS).contains(&self.stoptime),
            "program {name}: stoptime must be in 0..={MAX_STOPTIME_SECS} seconds"
        );

        if let Some(m) = self.umask {
            anyhow::ensure!(
                m <= 0o777,
                "program {name}: umask must be between 0 and 0777"
            );
        }

        if let Some(wd) = self.workingdir.as_deref() {
            anyhow::ensure!(
                wd.is_dir(),
                "program {name}: workingdir {} does not exist",
                wd.display()
            );
        }

        let mut exitcodes = BTreeSet::new();
        for c in self.exitcodes {
            anyhow::ensure!(
                (0..=255).contains(&c),
                "program {name}: exit codes must be between 0 and 255 (got {c})"
            );
            exitcodes.insert(c as i32);
        }

        let stopsignal = parse_signal(&self.stopsignal)
            .with_context(|| format!("program {name}: invalid stopsignal"))?;

        // Log paths must be openable now so a bad path fails startup instead
        // of every spawn.
        for (stream, path) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            if let Some(p) = path.as_deref() {
                open_append_log(p)
                    .with_context(|| format!("program {name}: {stream} path is not openable"))?;
            }
        }

        for key in self.env.keys() {
            anyhow::ensure!(
                !key.is_empty() && !key.contains('='),
                "program {name}: invalid environment variable name {key:?}"
            );
        }

        Ok(Program {
            name: name.to_string(),
            argv,
            numprocs: self.numprocs,
            workingdir: self.workingdir,
            umask: self.umask,
            autostart: self.autostart,
            autorestart: self.autorestart,
            exitcodes,
            startretries: self.startretries,
            starttime: Duration::from_secs_f64(self.starttime),
            stopsignal,
            stoptime: Duration::from_secs_f64(self.stoptime),
            stdout_path: self.stdout,
            stderr_path: self.stderr,
            env: self.env,
        })
    }
}

pub fn policy_from_str(raw: &str) -> anyhow::Result<Policy> {
    let file: ConfigFile =
        serde_yaml::from_str(raw).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;
    anyhow::ensure!(
        !file.programs.is_empty(),
        "configuration defines no programs"
    );

    let mut programs = BTreeMap::new();
    for (name, section) in file.programs {
        let program = section.into_program(&name)?;
        programs.insert(name, Arc::new(program));
    }
    Ok(Policy { programs })
}

pub fn load_policy(path: &Path) -> anyhow::Result<Policy> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
    policy_from_str(&raw).with_context(|| format!("config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(yaml: &str) -> Program {
        let policy = policy_from_str(yaml).expect("policy should parse");
        let (_, p) = policy.programs.into_iter().next().expect("one program");
        Arc::try_unwrap(p).expect("sole reference")
    }

    #[test]
    fn defaults_follow_the_documented_table() {
        let p = one("programs:\n  web:\n    cmd: /bin/sleep 60\n");
        assert_eq!(p.argv, vec!["/bin/sleep", "60"]);
        assert_eq!(p.numprocs, 1);
        assert!(p.autostart);
        assert_eq!(p.autorestart, Autorestart::Unexpected);
        assert_eq!(p.exitcodes, BTreeSet::from([0]));
        assert_eq!(p.startretries, 3);
        assert_eq!(p.starttime, Duration::from_secs(1));
        assert_eq!(p.stopsignal, Signal::SIGTERM);
        assert_eq!(p.stoptime, Duration::from_secs(10));
        assert!(p.umask.is_none());
        assert!(p.env.is_empty());
    }

    #[test]
    fn cmd_is_split_with_shell_quoting() {
        let p = one("programs:\n  echoer:\n    cmd: \"/bin/sh -c 'echo \\\"a b\\\"'\"\n");
        assert_eq!(p.argv, vec!["/bin/sh", "-c", "echo \"a b\""]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = policy_from_str("programs:\n  x:\n    cmd: /bin/true\n    nope: 1\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("nope"), "unexpected error: {err}");
    }

    #[test]
    fn exitcodes_accept_scalar_and_list() {
        let p = one("programs:\n  a:\n    cmd: /bin/true\n    exitcodes: 2\n");
        assert_eq!(p.exitcodes, BTreeSet::from([2]));
        let p = one("programs:\n  a:\n    cmd: /bin/true\n    exitcodes: [0, 2, 42]\n");
        assert_eq!(p.exitcodes, BTreeSet::from([0, 2, 42]));
    }

    #[test]
    fn out_of_range_exitcode_is_rejected() {
        assert!(policy_from_str("programs:\n  a:\n    cmd: /bin/true\n    exitcodes: [300]\n")
            .is_err());
    }

    #[test]
    fn umask_accepts_int_and_octal_string() {
        let p = one("programs:\n  a:\n    cmd: /bin/true\n    umask: \"022\"\n");
        assert_eq!(p.umask, Some(0o22));
        let p = one("programs:\n  a:\n    cmd: /bin/true\n    umask: \"0o27\"\n");
        assert_eq!(p.umask, Some(0o27));
    }

    #[test]
    fn durations_accept_floats() {
        let p = one("programs:\n  a:\n    cmd: /bin/true\n    starttime: 0.5\n    stoptime: 2\n");
        assert_eq!(p.starttime, Duration::from_millis(500));
        assert_eq!(p.stoptime, Duration::from_secs(2));
    }

    #[test]
    fn stopsignal_names_resolve() {
        for (name, sig) in [
            ("TERM", Signal::SIGTERM),
            ("INT", Signal::SIGINT),
            ("HUP", Signal::SIGHUP),
            ("QUIT", Signal::SIGQUIT),
            ("USR1", Signal::SIGUSR1),
            ("USR2", Signal::SIGUSR2),
            ("SIGTERM", Signal::SIGTERM),
            ("usr2", Signal::SIGUSR2),
        ] {
            assert_eq!(parse_signal(name).unwrap(), sig, "signal {name}");
        }
        assert!(parse_signal("WINCH").is_err());
    }

    #[test]
    fn bad_program_names_are_rejected() {
        assert!(policy_from_str("programs:\n  \"a b\":\n    cmd: /bin/true\n").is_err());
        assert!(policy_from_str("programs:\n  \"a.b\":\n    cmd: /bin/true\n").is_err());
        assert!(policy_from_str("programs:\n  a-b_2:\n    cmd: /bin/true\n").is_ok());
    }

    #[test]
    fn numprocs_zero_is_rejected() {
        assert!(policy_from_str("programs:\n  a:\n    cmd: /bin/true\n    numprocs: 0\n").is_err());
    }

    #[test]
    fn missing_cmd_fails() {
        assert!(policy_from_str("programs:\n  a:\n    numprocs: 1\n").is_err());
        assert!(policy_from_str("programs:\n  a:\n    cmd: \"\"\n").is_err());
    }

    #[test]
    fn max_stoptime_spans_programs() {
        let policy = policy_from_str(
            "programs:\n  a:\n    cmd: /bin/true\n    stoptime: 3\n  b:\n    cmd: /bin/true\n    stoptime: 7\n",
        )
        .unwrap();
        assert_eq!(policy.max_stoptime(), Duration::from_secs(7));
    }
}
