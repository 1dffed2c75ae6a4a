//! `fern`-backed logging setup: colored terminal output, a per-run file
//! sink under the product's data directory, pruned to the last 5 runs.

use std::fs;
use std::io;

use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

const MAX_RETAINED_LOGS: usize = 5;

pub fn init(verbosity: u64) -> Result<(), fern::InitError> {
    let level = level_filter(verbosity);

    let colors = ColoredLevelConfig::new()
        .info(Color::Green)
        .warn(Color::Yellow)
        .error(Color::Red)
        .debug(Color::Blue)
        .trace(Color::Magenta);
    let color_terminal = atty::is(atty::Stream::Stderr);

    let logs_dir = pingtunnel_core::paths::logs_dir();
    fs::create_dir_all(&logs_dir)?;
    prune_old_logs(&logs_dir);

    let log_path = logs_dir.join(format!("pingtunnel-{}.log", chrono::Utc::now().format("%Y%m%dT%H%M%SZ")));

    let stderr_dispatch = fern::Dispatch::new()
        .format(move |out, message, record| {
            let level = if color_terminal {
                colors.color(record.level()).to_string()
            } else {
                record.level().to_string()
            };
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                level,
                record.target(),
                message
            ))
        })
        .chain(io::stderr());

    let file_dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Utc::now().to_rfc3339(),
                record.level(),
                record.target(),
                message
            ))
        })
        .chain(fern::log_file(log_path)?);

    fern::Dispatch::new()
        .level(level)
        .chain(stderr_dispatch)
        .chain(file_dispatch)
        .apply()?;

    Ok(())
}

fn level_filter(verbosity: u64) -> LevelFilter {
    match std::env::var("PINGTUNNEL_LOG").ok().as_deref() {
        Some("trace") => return LevelFilter::Trace,
        Some("debug") => return LevelFilter::Debug,
        Some("info") => return LevelFilter::Info,
        Some("warn") => return LevelFilter::Warn,
        Some("error") => return LevelFilter::Error,
        _ => {}
    }
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Keeps at most `MAX_RETAINED_LOGS - 1` prior files so the one this run
/// is about to create stays within the budget. Best-effort: a file we
/// fail to remove is left for the next run to try again.
fn prune_old_logs(dir: &std::path::Path) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let mut logs: Vec<_> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|ext| ext == "log").unwrap_or(false))
        .collect();
    logs.sort_by_key(|e| e.file_name());
    if logs.len() + 1 > MAX_RETAINED_LOGS {
        for entry in &logs[..logs.len() + 1 - MAX_RETAINED_LOGS] {
            let _ = fs::remove_file(entry.path());
        }
    }
}
