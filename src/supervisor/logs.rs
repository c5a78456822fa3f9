// src/supervisor/logs.rs

//! Rotating gateway log files: size-based rotation with gzip-compressed
//! backups, stale-directory shifting at startup, and final-log compression
//! at shutdown.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const LOG_DIR_PREFIX: &str = "nvmeof-";
pub const LOG_FILE_NAME: &str = "nvmeof-log";

/// Generations of stale log directories kept as `.bak`, `.bak2`, ...
const BACKUP_DIR_GENERATIONS: u32 = 5;

/// Resolves `<log_dir>/nvmeof-<peer-name>`.
pub fn gateway_log_dir(log_directory: &str, gateway_name: &str) -> PathBuf {
    Path::new(log_directory).join(format!("{LOG_DIR_PREFIX}{gateway_name}"))
}

/// Shifts previous log directories one generation back, dropping the
/// oldest, so every gateway start gets a fresh directory.
pub fn rotate_backup_directories(dirname: &Path) {
    let name = |suffix: &str| -> PathBuf {
        let mut os = dirname.as_os_str().to_os_string();
        os.push(suffix);
        PathBuf::from(os)
    };
    let _ = fs::remove_dir_all(name(&format!(".bak{BACKUP_DIR_GENERATIONS}")));
    for i in (3..=BACKUP_DIR_GENERATIONS).rev() {
        let _ = fs::rename(name(&format!(".bak{}", i - 1)), name(&format!(".bak{i}")));
    }
    let _ = fs::rename(name(".bak"), name(".bak2"));
    let _ = fs::rename(dirname, name(".bak"));
    // In case the rename failed, never append to a stale directory.
    let _ = fs::remove_dir_all(dirname);
}

/// gzip-compresses `src` into `dest` and removes the source on success.
pub fn compress_file(src: &Path, dest: &Path) -> io::Result<()> {
    if src == dest {
        return Err(io::Error::other(
            "can't compress log file into the same file name",
        ));
    }
    let _ = fs::remove_file(dest);
    let mut input = File::open(src)?;
    let output = File::create(dest)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    if let Err(e) = io::copy(&mut input, &mut encoder).and_then(|_| encoder.finish().map(|_| ())) {
        let _ = fs::remove_file(dest);
        return Err(e);
    }
    let _ = fs::remove_file(src);
    Ok(())
}

/// Compresses the live log file once the gateway exits. Backups are already
/// compressed at rotation time.
pub fn compress_final_log_file(log_dir: &Path) {
    let live = log_dir.join(LOG_FILE_NAME);
    if !live.exists() {
        return;
    }
    let first_backup = log_dir.join(format!("{LOG_FILE_NAME}.1"));
    let zero_backup = log_dir.join(format!("{LOG_FILE_NAME}.0"));
    let dest = if first_backup.exists() && !zero_backup.exists() {
        zero_backup
    } else {
        log_dir.join(format!("{LOG_FILE_NAME}.gz"))
    };
    if let Err(e) = compress_file(&live, &dest) {
        error!("Failure compressing final log file: {e}");
    }
}

/// A size-rotating writer. When the live file reaches the limit it is
/// compressed into `<name>.1` and older backups shift up, with at most
/// `max_backups` kept.
pub struct RotatingLogWriter {
    dir: PathBuf,
    max_size: u64,
    max_backups: u32,
    rotation_enabled: bool,
    file: File,
    written: u64,
}

impl RotatingLogWriter {
    pub fn create(
        dir: PathBuf,
        max_file_size_mb: u64,
        max_backups: u32,
        rotation_enabled: bool,
    ) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            dir,
            max_size: max_file_size_mb * 1024 * 1024,
            max_backups,
            rotation_enabled,
            file,
            written,
        })
    }

    fn backup_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{LOG_FILE_NAME}.{index}"))
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let _ = fs::remove_file(self.backup_path(self.max_backups));
        for i in (2..=self.max_backups).rev() {
            let _ = fs::rename(self.backup_path(i - 1), self.backup_path(i));
        }
        let live = self.dir.join(LOG_FILE_NAME);
        if let Err(e) = compress_file(&live, &self.backup_path(1)) {
            warn!("Failure compressing rotated log file: {e}");
            let _ = fs::rename(&live, self.backup_path(1));
        }
        self.file = OpenOptions::new().create(true).append(true).open(&live)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.rotation_enabled
            && self.max_size > 0
            && self.max_backups > 0
            && self.written + buf.len() as u64 > self.max_size
        {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Prepares the gateway log directory, shifting old generations away.
/// Returns the writer feeding the file layer of the subscriber.
pub fn setup_log_writer(
    log_directory: &str,
    gateway_name: &str,
    max_file_size_mb: u64,
    max_backups: u32,
    rotation_enabled: bool,
) -> Option<RotatingLogWriter> {
    let dir = gateway_log_dir(log_directory, gateway_name);
    rotate_backup_directories(&dir);
    match RotatingLogWriter::create(dir.clone(), max_file_size_mb, max_backups, rotation_enabled) {
        Ok(writer) => {
            info!("Log files will be saved in {}", dir.display());
            Some(writer)
        }
        Err(e) => {
            error!(
                "Failed to set up log file handler in {}, the log wouldn't be saved to a file: {e}",
                dir.display()
            );
            None
        }
    }
}
