//! Session log for swarmsync
//!
//! Every run appends a full trace to `swarmsync-{session_id}.log` in the temp
//! directory. The console shows info lines, or debug lines with `--verbose`.
//! `RUST_LOG` overrides the file filter.

use std::path::{Path, PathBuf};

use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{Layer, fmt};
use uuid::Uuid;

use crate::progress;

const FILE_FILTER: &str = "warn,swarmsync=trace,swarmsync_core=trace,swarmsync_transport=trace,\
                           swarmsync_coordinator=trace,swarmsync_node=trace";

/// Where this run's trace goes, plus the guard that flushes it on drop
pub struct SessionInfo {
    pub session_id: Uuid,
    pub log_path: PathBuf,
    _guard: WorkerGuard,
}

fn log_file_name(session_id: Uuid) -> String {
    format!("swarmsync-{session_id}.log")
}

fn file_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(FILE_FILTER))
}

fn console_level(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

fn file_layer<S>(writer: NonBlocking) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(file_filter())
}

fn console_layer<S>(verbose: bool) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(progress::ProgressWriter)
        .with_target(false)
        .with_filter(console_level(verbose))
}

/// Install the global subscriber writing to a fresh log under `dir`
pub fn init_in(dir: &Path, verbose: bool) -> SessionInfo {
    let session_id = Uuid::new_v4();
    let name = log_file_name(session_id);
    let appender = tracing_appender::rolling::never(dir, &name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(file_layer(writer))
        .with(console_layer(verbose))
        .init();

    SessionInfo {
        session_id,
        log_path: dir.join(name),
        _guard: guard,
    }
}

/// Same as [`init_in`] with the system temp directory
pub fn init(verbose: bool) -> SessionInfo {
    init_in(&std::env::temp_dir(), verbose)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_is_named_after_session() {
        let id = Uuid::nil();
        assert_eq!(
            log_file_name(id),
            "swarmsync-00000000-0000-0000-0000-000000000000.log"
        );
    }

    #[test]
    fn test_default_file_filter_parses() {
        assert!(EnvFilter::try_new(FILE_FILTER).is_ok());
    }

    #[test]
    fn test_verbose_lowers_console_level() {
        assert_eq!(console_level(false), LevelFilter::INFO);
        assert_eq!(console_level(true), LevelFilter::DEBUG);
    }
}
