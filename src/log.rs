use crate::errors::{MirrorError, MirrorErrorType, Result};
use chrono::Utc;
use directories::BaseDirs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

const LOG_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Default, Clone)]
pub struct LogOptions {
    /// Defaults to `<data dir>/mirrorfs/logs`.
    pub log_dir: Option<PathBuf>,
    pub debug: bool,
    /// Also write human readable output to stdout.
    pub stdout: bool,
}

/// Install the global subscriber. The returned guard must be kept alive for as
/// long as logs should reach the file.
pub fn init_logging(options: &LogOptions) -> Result<WorkerGuard> {
    let log_file = get_log_location(options.log_dir.as_deref())?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let default_level = if options.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let formatter = BunyanFormattingLayer::new("mirrorfs".into(), non_blocking);
    let stdout = options
        .stdout
        .then(|| tracing_subscriber::fmt::layer().with_target(false).boxed());

    let subscriber = Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(formatter)
        .with(stdout);
    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        MirrorError::new(
            MirrorErrorType::InternalError,
            format!("Failed to install log subscriber: {}", e),
        )
    })?;
    // notify reports through the log crate
    if let Err(e) = tracing_log::LogTracer::init() {
        tracing::warn!("log records will not be captured: {}", e);
    }

    tracing::info!("Logging to {}", log_file.display());
    Ok(guard)
}

fn default_log_dir() -> Result<PathBuf> {
    let base_dirs = BaseDirs::new().ok_or_else(|| {
        MirrorError::new(
            MirrorErrorType::NotFound,
            "Could not determine the user data directory".to_string(),
        )
    })?;
    Ok(base_dirs.data_dir().join("mirrorfs").join("logs"))
}

fn get_log_location(log_dir: Option<&Path>) -> Result<PathBuf> {
    let log_dir = match log_dir {
        Some(dir) => dir.to_path_buf(),
        None => default_log_dir()?,
    };
    std::fs::create_dir_all(&log_dir)?;
    let timestamp = Utc::now().format("%Y-%m-%d-%H-%M-%S");
    let log_file = log_dir.join(format!("mirrorfs-{}.log", timestamp));
    clean_logfiles(&log_dir, LOG_RETENTION_DAYS);
    Ok(log_file)
}

/// Delete log files last modified more than `max_age_days` ago. Anything that
/// cannot be inspected or removed is left alone.
fn clean_logfiles(log_dir: &Path, max_age_days: i64) -> usize {
    let Ok(files) = std::fs::read_dir(log_dir) else {
        return 0;
    };
    let mut removed = 0;
    for file in files.flatten() {
        let path = file.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let Ok(modified) = file.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        let modified: chrono::DateTime<Utc> = chrono::DateTime::from(modified);
        let age = Utc::now().signed_duration_since(modified);
        if age.num_days() > max_age_days && std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn log_location_is_created_and_timestamped() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("nested/logs");
        let file = get_log_location(Some(&dir)).unwrap();
        assert!(dir.is_dir());
        assert_eq!(file.parent().unwrap(), dir);
        let name = file.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("mirrorfs-") && name.ends_with(".log"));
    }

    #[test]
    fn only_old_log_files_are_removed() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("fresh.log"), b"").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"").unwrap();
        assert_eq!(clean_logfiles(tmp.path(), 30), 0);
        // With a negative age limit every log file counts as stale.
        assert_eq!(clean_logfiles(tmp.path(), -1), 1);
        assert!(tmp.path().join("notes.txt").exists());
        assert!(!tmp.path().join("fresh.log").exists());
    }
}
