use crate::tm::manager::{JobManager, StatusEntry};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::sync::Arc;

const HELP: &str = "\
Available commands:

  status                    show every instance: state, pid, uptime, last exit
  start <name|name:index>   start a program or one instance
  stop <name|name:index>    stop a program or one instance
  restart <name|name:index> stop, then start once stopped
  help                      show this help
  exit                      stop all programs and leave";

/// Interactive control shell. Blocks until `exit`, EOF, or an externally
/// initiated shutdown.
pub fn run_shell(mgr: Arc<JobManager>) {
    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("failed to initialize shell: {e}");
            return;
        }
    };
    println!("Taskmaster control shell. Type 'help' for available commands.");
    loop {
        if mgr.is_shutting_down() {
            break;
        }
        match rl.readline("taskmaster> ") {
            Ok(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(&line);
                if !dispatch(&mgr, &line) {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("shell error: {e}");
                break;
            }
        }
    }
}

/// Returns false once the shell should end.
fn dispatch(mgr: &JobManager, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return true;
    };
    let args: Vec<&str> = words.collect();

    match cmd {
        "status" => print!("{}", render_status_table(&mgr.status())),
        "start" => {
            if args.is_empty() {
                println!("usage: start <name|name:index>");
            }
            for target in args {
                match mgr.start(target) {
                    Ok(out) => {
                        for (ident, o) in out {
                            println!("{ident}: {o}");
                        }
                    }
                    Err(e) => println!("{target}: error: {e}"),
                }
            }
        }
        "stop" => {
            if args.is_empty() {
                println!("usage: stop <name|name:index>");
            }
            for target in args {
                match mgr.stop(target) {
                    Ok(out) => {
                        for (ident, o) in out {
                            println!("{ident}: {o}");
                        }
                    }
                    Err(e) => println!("{target}: error: {e}"),
                }
            }
        }
        "restart" => {
            if args.is_empty() {
                println!("usage: restart <name|name:index>");
            }
            for target in args {
                match mgr.restart(target) {
                    Ok(out) => {
                        for (ident, o) in out {
                            println!("{ident}: {o}");
                        }
                    }
                    Err(e) => println!("{target}: error: {e}"),
                }
            }
        }
        "help" => println!("{HELP}"),
        "exit" => return false,
        other => println!("unknown command: {other} (type 'help' for available commands)"),
    }
    true
}

fn pad(s: &str, width: usize) -> String {
    if s.len() >= width {
        return s.to_string();
    }
    let mut out = String::with_capacity(width);
    out.push_str(s);
    out.push_str(&" ".repeat(width - s.len()));
    out
}

fn border(widths: &[usize]) -> String {
    let mut out = String::new();
    out.push('+');
    for w in widths {
        // 1 leading + 1 trailing padding space per cell.
        out.push_str(&"-".repeat(*w + 2));
        out.push('+');
    }
    out
}

fn row_line(cols: &[String], widths: &[usize]) -> String {
    let mut out = String::new();
    out.push('|');
    for (i, w) in widths.iter().enumerate() {
        let v = cols.get(i).map(|s| s.as_str()).unwrap_or("");
        out.push(' ');
        out.push_str(&pad(v, *w));
        out.push(' ');
        out.push('|');
    }
    out
}

fn render_status_table(rows: &[StatusEntry]) -> String {
    if rows.is_empty() {
        return "(no programs)\n".to_string();
    }

    let headers = [
        "instance",
        "state",
        "pid",
        "uptime",
        "last_exit_code",
        "retries_remaining",
    ];

    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            vec![
                r.name.clone(),
                r.state.clone(),
                r.pid.to_string(),
                format!("{}s", r.uptime),
                r.last_exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                r.retries_remaining.to_string(),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &body {
        for (i, c) in row.iter().enumerate() {
            widths[i] = widths[i].max(c.len());
        }
    }

    let top = border(&widths);
    let mut out = String::new();
    out.push_str(&top);
    out.push('\n');
    out.push_str(&row_line(
        &headers.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        &widths,
    ));
    out.push('\n');
    out.push_str(&top);
    out.push('\n');
    for row in &body {
        out.push_str(&row_line(row, &widths));
        out.push('\n');
    }
    out.push_str(&top);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, state: &str, pid: i32, code: Option<i32>) -> StatusEntry {
        StatusEntry {
            name: name.to_string(),
            state: state.to_string(),
            pid,
            uptime: 12,
            last_exit_code: code,
            retries_remaining: 3,
        }
    }

    #[test]
    fn table_includes_every_column() {
        let out = render_status_table(&[
            entry("web:0", "RUNNING", 4242, None),
            entry("web:1", "EXITED", 0, Some(0)),
        ]);
        assert!(out.contains("instance"));
        assert!(out.contains("last_exit_code"));
        assert!(out.contains("web:0"));
        assert!(out.contains("RUNNING"));
        assert!(out.contains("4242"));
        assert!(out.contains("12s"));
        // None renders as a dash, a real code as the number.
        assert!(out.lines().any(|l| l.contains("web:0") && l.contains(" - ")));
        assert!(out.lines().any(|l| l.contains("web:1") && l.contains(" 0 ")));
    }

    #[test]
    fn empty_registry_renders_placeholder() {
        assert_eq!(render_status_table(&[]), "(no programs)\n");
    }

    #[test]
    fn columns_align_across_rows() {
        let out = render_status_table(&[
            entry("a:0", "RUNNING", 1, None),
            entry("longer-name:0", "BACKOFF", 123456, Some(-9)),
        ]);
        let line_widths: Vec<usize> = out.lines().map(|l| l.len()).collect();
        assert!(line_widths.windows(2).all(|w| w[0] == w[1]));
    }
}
