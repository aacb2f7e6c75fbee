//! Append-only per-device, per-day record streams with follow cursors.

use chrono::{Local, NaiveDate, NaiveDateTime};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::capture::record::{LogRecord, RECEIPT_FORMAT};
use crate::capture::types::CaptureResult;

/// Stream for payloads that did not match the envelope pattern
pub const RAW_STREAM: &str = "raw.log";

/// Service lifecycle messages
pub const SERVER_STREAM: &str = "server.log";

/// Day component of stream file names
const DAY_FORMAT: &str = "%d.%m.%Y";

/// File-backed record store.
///
/// Writers to the same file are serialized through a per-file lock; readers
/// take the same lock so they never observe a half-written line.
#[derive(Debug)]
pub struct LogStore {
    dir: PathBuf,
    file_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    /// (stream, caller) -> byte offset of the next unread record
    cursors: Mutex<HashMap<(PathBuf, String), u64>>,
    /// Stream length observed just before the first append since the last reset
    baselines: Mutex<HashMap<PathBuf, u64>>,
}

impl LogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            file_locks: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            baselines: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<host>_<dd.mm.YYYY>.log`
    pub fn stream_path(&self, host: &str, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}_{}.log", host, day.format(DAY_FORMAT)))
    }

    pub fn raw_path(&self) -> PathBuf {
        self.dir.join(RAW_STREAM)
    }

    pub fn server_path(&self) -> PathBuf {
        self.dir.join(SERVER_STREAM)
    }

    /// Forget all cursors. Called when the capture service (re)starts.
    pub fn reset_cursors(&self) {
        lock(&self.cursors).clear();
        lock(&self.baselines).clear();
    }

    /// Store one received datagram. Returns the stream it was appended to.
    pub fn ingest(
        &self,
        payload: &[u8],
        peer: SocketAddr,
        received_at: NaiveDateTime,
    ) -> CaptureResult<PathBuf> {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim().replace(['\r', '\n'], " ");
        let record = LogRecord::from_payload(&text, peer, received_at);

        let path = if record.is_structured() {
            self.stream_path(&peer.ip().to_string(), received_at.date())
        } else {
            self.raw_path()
        };
        self.append(&path, &record.line)?;
        Ok(path)
    }

    /// Append one line, creating the directory and file as needed
    pub fn append(&self, path: &Path, line: &str) -> CaptureResult<()> {
        let file_lock = self.file_lock(path);
        let _guard = lock(&file_lock);

        fs::create_dir_all(&self.dir)?;
        {
            let mut baselines = lock(&self.baselines);
            if !baselines.contains_key(path) {
                baselines.insert(path.to_path_buf(), file_len(path)?);
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(format!("{}\n", line).as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Write a lifecycle message to the server stream
    pub fn log_server_message(&self, message: &str) -> CaptureResult<()> {
        let now = Local::now().naive_local().format(RECEIPT_FORMAT);
        self.append(&self.server_path(), &format!("{} {}", now, message))
    }

    /// Every record of the device's current stream.
    ///
    /// Today's stream is preferred; before the first record of the day the
    /// newest earlier stream for the host is returned. No stream at all is an
    /// empty result.
    pub fn read_full(&self, host: &str) -> CaptureResult<Vec<LogRecord>> {
        let today = self.stream_path(host, Local::now().date_naive());
        let path = if today.exists() {
            today
        } else {
            match self.latest_stream(host)? {
                Some(path) => path,
                None => return Ok(Vec::new()),
            }
        };

        let file_lock = self.file_lock(&path);
        let _guard = lock(&file_lock);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(parse_lines(&text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Records appended to today's stream since `caller`'s previous follow
    /// read; advances the cursor to end of stream.
    ///
    /// A caller without a cursor starts from where the stream stood when the
    /// store was last reset.
    pub fn read_follow(&self, host: &str, caller: &str) -> CaptureResult<Vec<LogRecord>> {
        let path = self.stream_path(host, Local::now().date_naive());
        let file_lock = self.file_lock(&path);
        let _guard = lock(&file_lock);

        let len = file_len(&path)?;
        let key = (path.clone(), caller.to_string());
        let offset = {
            let cursors = lock(&self.cursors);
            match cursors.get(&key) {
                Some(offset) => *offset,
                None => lock(&self.baselines).get(&path).copied().unwrap_or(len),
            }
        };
        if len <= offset {
            lock(&self.cursors).insert(key, offset);
            return Ok(Vec::new());
        }

        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity((len - offset) as usize);
        file.take(len - offset).read_to_end(&mut buf)?;
        lock(&self.cursors).insert(key, offset + buf.len() as u64);

        Ok(parse_lines(&String::from_utf8_lossy(&buf)))
    }

    fn latest_stream(&self, host: &str) -> CaptureResult<Option<PathBuf>> {
        let prefix = format!("{}_", host);
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut newest: Option<(NaiveDate, PathBuf)> = None;
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(day) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".log"))
                .and_then(|day| NaiveDate::parse_from_str(day, DAY_FORMAT).ok())
            else {
                continue;
            };
            if newest.as_ref().is_none_or(|(best, _)| day > *best) {
                newest = Some((day, path));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }

    fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        lock(&self.file_locks)
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }
}

fn parse_lines(text: &str) -> Vec<LogRecord> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(LogRecord::from_line)
        .collect()
}

fn file_len(path: &Path) -> CaptureResult<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// A poisoned lock only means another handler panicked mid-append; the maps
/// stay usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
