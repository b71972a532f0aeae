//! Per-process log files: capture, rotation, and tailing.
//!
//! Each managed process owns `<processId>.log` in the daemon's log
//! directory. Child stdout/stderr are drained by writer threads. When a
//! log exceeds the rotation size it is gzip-compressed into `<id>.1.log.gz`
//! and older generations shift up, bounded at five.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Read, Write},
    path::{Path, PathBuf},
    thread,
};

use flate2::{Compression, write::GzEncoder};
use tracing::{debug, warn};

use crate::{
    constants::{LOG_MAX_GENERATIONS, LOG_ROTATE_SIZE},
    runtime,
};

/// Returns the log file path for a process id.
pub fn log_path(process_id: &str) -> PathBuf {
    runtime::log_dir().join(format!("{process_id}.log"))
}

fn generation_path(base: &Path, generation: u32) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.with_file_name(format!("{stem}.{generation}.log.gz"))
}

/// Rotates `path` if it exceeds `limit` bytes: the current file is
/// compressed into generation 1, generations shift up, and the sixth
/// generation is deleted.
pub fn rotate_if_needed(path: &Path, limit: u64) -> io::Result<()> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if meta.len() <= limit {
        return Ok(());
    }

    let oldest = generation_path(path, LOG_MAX_GENERATIONS);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for generation in (1..LOG_MAX_GENERATIONS).rev() {
        let from = generation_path(path, generation);
        if from.exists() {
            fs::rename(&from, generation_path(path, generation + 1))?;
        }
    }

    let source = File::open(path)?;
    let dest = File::create(generation_path(path, 1))?;
    let mut encoder = GzEncoder::new(dest, Compression::default());
    io::copy(&mut BufReader::new(source), &mut encoder)?;
    encoder.finish()?;
    fs::write(path, b"")?;
    debug!("rotated log {:?}", path);
    Ok(())
}

/// Appends one line to `path`, rotating first when the file is over the
/// limit.
pub fn append_line(path: &Path, line: &str, rotate_limit: u64) -> io::Result<()> {
    rotate_if_needed(path, rotate_limit)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Drains a child output stream into the process log on a writer thread.
pub fn spawn_output_writer(
    process_id: String,
    stream: impl Read + Send + 'static,
) -> thread::JoinHandle<()> {
    let path = log_path(&process_id);
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else {
                break;
            };
            if let Err(err) = append_line(&path, &line, LOG_ROTATE_SIZE) {
                warn!("failed to write log for process {process_id}: {err}");
            }
        }
    })
}

/// Returns the last `lines` plain-text lines of `path`.
pub fn tail_file(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let all: Vec<&str> = raw.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|s| (*s).to_string()).collect())
}

/// Returns the last `lines` lines of the process's log.
pub fn tail(process_id: &str, lines: usize) -> io::Result<Vec<String>> {
    tail_file(&log_path(process_id), lines)
}
