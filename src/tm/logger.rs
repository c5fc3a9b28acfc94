use crate::tm::asyncutil::tasks;
use anyhow::Context as _;
use chrono::Local;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

// Supervisor log defaults (independent of per-instance stdout/stderr logs).
const SUPERVISOR_LOG_NAME: &str = "taskmaster";
const SUPERVISOR_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const SUPERVISOR_LOG_BACKUPS: usize = 5;

static LOG_TX: OnceLock<mpsc::UnboundedSender<String>> = OnceLock::new();
static EARLY_LOG: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();
const EARLY_LOG_MAX_LINES: usize = 1000;

/// Emit one supervisor event line: timestamp, component, optional instance,
/// then key=value details. Goes to stderr immediately and to the rotating
/// log file once its writer task is up; lines logged before that are
/// buffered and flushed by the writer.
pub fn tm_event(component: &str, instance: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    let line = match instance {
        Some(id) => format!("{ts} [{component}] instance={id} {}", msg.as_ref()),
        None => format!("{ts} [{component}] {}", msg.as_ref()),
    };
    eprintln!("{line}");
    if let Some(tx) = LOG_TX.get() {
        let _ = tx.send(line);
    } else {
        let q = EARLY_LOG.get_or_init(|| Mutex::new(VecDeque::new()));
        let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
        g.push_back(line);
        while g.len() > EARLY_LOG_MAX_LINES {
            g.pop_front();
        }
    }
}

/// Start the rotating supervisor log under `$CWD/logs/`.
pub fn start_supervisor_log() {
    let base_path = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("logs")
        .join(format!("{SUPERVISOR_LOG_NAME}.log"));

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if LOG_TX.set(tx).is_err() {
        return;
    }

    tm_event(
        "log",
        None,
        format!(
            "supervisor_log path={} rotate=size max_bytes={SUPERVISOR_LOG_MAX_BYTES} backups={SUPERVISOR_LOG_BACKUPS}",
            base_path.display()
        ),
    );

    tasks().spawn(async move {
        let mut f = match open_append_async(&base_path).await {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "{} [log] failed to open supervisor log {} err={e}",
                    Local::now().format("%Y-%m-%d_%H:%M:%S%.3f"),
                    base_path.display()
                );
                return;
            }
        };

        // Flush boot lines buffered before the writer existed.
        if let Some(q) = EARLY_LOG.get() {
            let drained: Vec<String> = {
                let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
                g.drain(..).collect()
            };
            for line in drained {
                let mut s = line;
                if !s.ends_with('\n') {
                    s.push('\n');
                }
                let _ = f.write_all(s.as_bytes()).await;
            }
            let _ = f.flush().await;
        }

        let mut bytes_written: u64 = tokio::fs::metadata(&base_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        while let Some(line) = rx.recv().await {
            if bytes_written >= SUPERVISOR_LOG_MAX_BYTES {
                let _ = f.flush().await;
                if let Ok(nf) = rotate_numbered_reopen(&base_path, SUPERVISOR_LOG_BACKUPS).await {
                    f = nf;
                    bytes_written = 0;
                }
            }

            let mut s = line;
            if !s.ends_with('\n') {
                s.push('\n');
            }
            if f.write_all(s.as_bytes()).await.is_ok() {
                bytes_written = bytes_written.saturating_add(s.len() as u64);
            }
            let _ = f.flush().await;
        }
    });
}

async fn open_append_async(path: &Path) -> anyhow::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }
    }
    let f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open log {}", path.display()))?;
    Ok(f)
}

/// Size-based rotation: base -> base.1 -> base.2 ... dropping base.{backups}.
async fn rotate_numbered_reopen(base_path: &Path, backups: usize) -> anyhow::Result<tokio::fs::File> {
    if backups == 0 {
        if tokio::fs::metadata(base_path).await.is_ok() {
            let _ = tokio::fs::remove_file(base_path).await;
        }
        return open_append_async(base_path).await;
    }

    let oldest = PathBuf::from(format!("{}.{}", base_path.display(), backups));
    if tokio::fs::metadata(&oldest).await.is_ok() {
        let _ = tokio::fs::remove_file(&oldest).await;
    }

    for i in (1..backups).rev() {
        let from = PathBuf::from(format!("{}.{}", base_path.display(), i));
        let to = PathBuf::from(format!("{}.{}", base_path.display(), i + 1));
        if tokio::fs::metadata(&from).await.is_ok() {
            let _ = tokio::fs::rename(&from, &to).await;
        }
    }

    let to1 = PathBuf::from(format!("{}.1", base_path.display()));
    if tokio::fs::metadata(base_path).await.is_ok() {
        let _ = tokio::fs::rename(base_path, &to1).await;
    }

    open_append_async(base_path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tm-logger-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn rotation_shifts_numbered_backups() {
        let dir = scratch_dir("shift");
        let base = dir.join("taskmaster.log");
        std::fs::write(&base, "current\n").unwrap();
        std::fs::write(format!("{}.1", base.display()), "one\n").unwrap();
        std::fs::write(format!("{}.2", base.display()), "two\n").unwrap();

        let _f = rotate_numbered_reopen(&base, 3).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(format!("{}.1", base.display())).unwrap(),
            "current\n"
        );
        assert_eq!(
            std::fs::read_to_string(format!("{}.2", base.display())).unwrap(),
            "one\n"
        );
        assert_eq!(
            std::fs::read_to_string(format!("{}.3", base.display())).unwrap(),
            "two\n"
        );
        assert_eq!(std::fs::read_to_string(&base).unwrap(), "");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn rotation_drops_the_oldest_backup() {
        let dir = scratch_dir("drop");
        let base = dir.join("taskmaster.log");
        std::fs::write(&base, "current\n").unwrap();
        std::fs::write(format!("{}.1", base.display()), "one\n").unwrap();
        std::fs::write(format!("{}.2", base.display()), "two\n").unwrap();

        let _f = rotate_numbered_reopen(&base, 2).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(format!("{}.1", base.display())).unwrap(),
            "current\n"
        );
        assert_eq!(
            std::fs::read_to_string(format!("{}.2", base.display())).unwrap(),
            "one\n"
        );
        assert!(!Path::new(&format!("{}.3", base.display())).exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn zero_backups_truncates_in_place() {
        let dir = scratch_dir("zero");
        let base = dir.join("taskmaster.log");
        std::fs::write(&base, "current\n").unwrap();

        let _f = rotate_numbered_reopen(&base, 0).await.unwrap();

        assert_eq!(std::fs::read_to_string(&base).unwrap(), "");
        assert!(!Path::new(&format!("{}.1", base.display())).exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
