pub mod asyncutil;
pub mod cli;
pub mod config;
pub mod instance;
pub mod logger;
pub mod manager;
pub mod monitor;
pub mod shell;
pub mod web;

use crate::tm::asyncutil::tasks;
use crate::tm::logger::tm_event;
use crate::tm::manager::JobManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal as unix_signal, SignalKind};

/// Exit codes: 0 graceful shutdown, 1 configuration failure, 2 unrecoverable
/// runtime error.
pub fn run(args: cli::Args) -> i32 {
    // Fail fast before any side effects: no children are started on a bad
    // configuration.
    let policy = match config::load_policy(&args.config) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return 1;
        }
    };

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build runtime: {e}");
            return 2;
        }
    };
    match rt.block_on(run_async(policy, args)) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            2
        }
    }
}

async fn run_async(policy: config::Policy, args: cli::Args) -> anyhow::Result<()> {
    logger::start_supervisor_log();
    tm_event(
        "boot",
        None,
        format!(
            "taskmaster v{} programs={}",
            env!("CARGO_PKG_VERSION"),
            policy.programs.len()
        ),
    );

    let shutting_down = Arc::new(AtomicBool::new(false));
    let mgr = Arc::new(JobManager::new(policy, Arc::clone(&shutting_down)));

    let monitor = monitor::spawn_monitor(Arc::clone(&mgr));
    web::start_status_server(Arc::clone(&mgr), args.bind, Arc::clone(&shutting_down));
    start_signal_listener(Arc::clone(&mgr), Arc::clone(&shutting_down));
    start_worker_stats_reporter(Arc::clone(&shutting_down));

    mgr.autostart();

    let shell_mgr = Arc::clone(&mgr);
    let shell = tasks().spawn_blocking(move || shell::run_shell(shell_mgr));

    // The shell ends on `exit`/EOF; a termination signal ends it from
    // outside (the blocked readline dies with the process).
    tokio::select! {
        r = shell => { let _ = r; }
        _ = flag_set(Arc::clone(&shutting_down)) => {}
    }

    graceful_shutdown(&mgr).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), monitor).await;
    tm_event("shutdown", None, "outcome=done");
    Ok(())
}

async fn flag_set(flag: Arc<AtomicBool>) {
    while !flag.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Periodic worker-stats event so a background worker that never returns is
/// visible in the supervisor log.
fn start_worker_stats_reporter(flag: Arc<AtomicBool>) {
    tasks().spawn(async move {
        while !flag.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let (alive, started) = tasks().stats();
            tm_event(
                "tasks",
                None,
                format!("workers_alive={alive} workers_started={started}"),
            );
        }
    });
}

/// Handlers only flip flags; all real work happens at monitor tick
/// boundaries. The first INT/TERM starts a graceful shutdown, the second
/// kills every child outright.
fn start_signal_listener(mgr: Arc<JobManager>, flag: Arc<AtomicBool>) {
    tasks().spawn(async move {
        let mut term = unix_signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut int = unix_signal(SignalKind::interrupt()).expect("SIGINT handler");
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        tm_event("signal", None, "event=shutdown_signal decision=graceful");
        flag.store(true, Ordering::Relaxed);

        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        tm_event("signal", None, "event=shutdown_signal decision=kill_all");
        mgr.kill_all();
    });
}

async fn graceful_shutdown(mgr: &Arc<JobManager>) {
    tm_event("shutdown", None, "event=begin stop_all=true");
    mgr.begin_shutdown();

    // The monitor reaps and escalates per-instance stop deadlines; this
    // outer deadline only bounds the whole shutdown.
    let deadline = Instant::now() + mgr.max_stoptime() + Duration::from_secs(4);
    while !mgr.all_terminal() {
        if Instant::now() >= deadline {
            tm_event("shutdown", None, "event=deadline decision=kill_all");
            mgr.kill_all();
            let settle = Instant::now() + Duration::from_secs(2);
            while !mgr.all_terminal() && Instant::now() < settle {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
