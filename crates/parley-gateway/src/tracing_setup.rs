use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

const TRACE_FILE_ENV: &str = "PARLEY_TRACE_FILE";

/// Holds the trace file writer open for the life of the process.
pub(crate) struct TracingGuard {
    _file: Option<WorkerGuard>,
}

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Non-blocking writer for the JSONL trace file named by `PARLEY_TRACE_FILE`.
fn trace_file_writer() -> Option<(NonBlocking, WorkerGuard)> {
    let path = PathBuf::from(std::env::var(TRACE_FILE_ENV).ok()?);
    let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let name = path
        .file_name()
        .map_or_else(|| "parley.jsonl".to_owned(), |f| f.to_string_lossy().into_owned());
    Some(tracing_appender::non_blocking(
        tracing_appender::rolling::never(dir, name),
    ))
}

/// Logs go to stderr at `RUST_LOG` (or `info`); stdout is left to the
/// `chat` and `check` commands. A trace file, when configured, records
/// span open/close events at `debug` as JSON lines.
pub(crate) fn init() -> TracingGuard {
    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter_or("info"));

    let (file_layer, file_guard) = match trace_file_writer() {
        Some((writer, guard)) => {
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_filter(filter_or("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default().with(console).with(file_layer).init();

    TracingGuard { _file: file_guard }
}
