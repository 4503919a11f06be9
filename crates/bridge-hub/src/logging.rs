use crate::config::Config;
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

pub const LOG_LEVEL_ENV: &str = "BRIDGE_LOG_LEVEL";

/// `--debug` wins, then `BRIDGE_LOG_LEVEL`, then `RUST_LOG`, then `info`.
pub fn log_filter(debug: bool) -> EnvFilter {
    if debug {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_env(LOG_LEVEL_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn log_file_path(log_dir: &Path) -> PathBuf {
    log_dir.join(format!("bridge-hub-{}.log", std::process::id()))
}

/// Opens the append-only log file, or `None` when `log_dir` is empty.
pub fn open_log_file(log_dir: &str) -> io::Result<Option<(PathBuf, File)>> {
    if log_dir.is_empty() {
        return Ok(None);
    }
    let dir = Path::new(log_dir);
    std::fs::create_dir_all(dir)?;
    let path = log_file_path(dir);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Some((path, file)))
}

/// Installs the global subscriber: stdout, teed into the log file when one
/// could be opened. Returns the log file path in use.
pub fn init_logging(config: &Config) -> Option<PathBuf> {
    let (writer, path) = match open_log_file(&config.log_dir) {
        Ok(Some((path, file))) => (
            BoxMakeWriter::new(io::stdout.and(Arc::new(file))),
            Some(path),
        ),
        Ok(None) => (BoxMakeWriter::new(io::stdout), None),
        Err(err) => {
            eprintln!("log_file_error: dir={} error={err}", config.log_dir);
            (BoxMakeWriter::new(io::stdout), None)
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(config.debug))
        .with_writer(writer)
        .try_init()
        .ok()?;
    path
}
