use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

/// Initialise logging to stderr, plus a timestamped log file in
/// `reports_dir` when given. A `bluefruit.log` symlink points at the newest
/// file (Unix only). Safe to call more than once; later calls are no-ops.
///
/// Returns the log file path when file logging was enabled.
pub fn init_logging(reports_dir: Option<&Path>, verbose: bool) -> Result<Option<PathBuf>, String> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let (writer, log_path) = match reports_dir {
        Some(dir) => {
            let (file, path) = open_log_file(dir)?;
            (
                BoxMakeWriter::new(std::io::stderr.and(Mutex::new(file))),
                Some(path),
            )
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let installed = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_ansi(log_path.is_none())
        .with_writer(writer)
        .try_init()
        .is_ok();

    if installed {
        if let Some(path) = &log_path {
            tracing::info!("[logging] File logging started: {}", path.display());
        }
    }
    Ok(log_path)
}

fn open_log_file(reports_dir: &Path) -> Result<(std::fs::File, PathBuf), String> {
    std::fs::create_dir_all(reports_dir)
        .map_err(|e| format!("Failed to create reports dir: {}", e))?;

    let filename = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-bluefruit.log")
        .to_string();
    let log_path = reports_dir.join(&filename);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("Failed to create log file: {}", e))?;

    // Windows symlinks require elevated privileges
    #[cfg(unix)]
    {
        let symlink_path = reports_dir.join("bluefruit.log");
        let _ = std::fs::remove_file(&symlink_path);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &symlink_path) {
            eprintln!("[logging] Failed to create bluefruit.log symlink: {}", e);
        }
    }

    Ok((file, log_path))
}
