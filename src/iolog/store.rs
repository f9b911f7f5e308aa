//! Session creation, append, replay and restart.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info};

use crate::error_handling::types::IoLogError;
use crate::iolog::info::LogInfo;
use crate::iolog::path::{
    expand_escapes, validate_log_id, PathEscapes, SessionIdAllocator, SESSID_SPACE,
};
use crate::iolog::restart;
use crate::iolog::timing::{IoStream, TimingPayload, TimingRecord};

const SEQ_TOKEN: &str = "%{seq}";

#[derive(Debug, Clone)]
pub struct IoLogStoreOptions {
    /// Root directory for all session logs.
    pub root: PathBuf,
    /// Path pattern relative to the root; `%{seq}` must be the final
    /// component when present.
    pub pattern: String,
    /// Mode bits for created files; directories get search bits added.
    pub file_mode: u32,
    /// Compress data streams with gzip.
    pub compress: bool,
    /// Highest session sequence number before the counter recycles.
    pub maxseq: u64,
}

impl Default for IoLogStoreOptions {
    fn default() -> Self {
        IoLogStoreOptions {
            root: PathBuf::from("/var/log/iologd"),
            pattern: SEQ_TOKEN.to_string(),
            file_mode: 0o600,
            compress: false,
            maxseq: SESSID_SPACE,
        }
    }
}

fn dir_mode(file_mode: u32) -> u32 {
    file_mode | ((file_mode & 0o444) >> 2) | 0o700
}

/// Byte positions reached by replaying a prefix of the timing file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOffsets {
    pub timing_bytes: u64,
    pub stream_bytes: [u64; 5],
    pub records: usize,
}

/// Replay timing records from the start of the log, accumulating elapsed
/// time, and return the offsets at which the accumulated time equals
/// `target`. A target that falls between records, or past the end of the
/// log, is a resume-point mismatch.
pub fn seek_to_elapsed(dir: &Path, target: Duration) -> Result<LogOffsets, IoLogError> {
    let mut reader = BufReader::new(File::open(dir.join("timing"))?);
    let mut offsets = LogOffsets::default();
    let mut elapsed = Duration::ZERO;
    let mut line = String::new();
    loop {
        if elapsed == target {
            return Ok(offsets);
        }
        line.clear();
        let nread = reader.read_line(&mut line)?;
        if nread == 0 {
            return Err(IoLogError::ResumeMismatch { target, elapsed });
        }
        let record = TimingRecord::parse_line(line.trim_end_matches('\n'))?;
        elapsed += record.delay;
        offsets.timing_bytes += nread as u64;
        offsets.records += 1;
        if let TimingPayload::Io { stream, len } = record.payload {
            offsets.stream_bytes[stream.index()] += len;
        }
        if elapsed > target {
            return Err(IoLogError::ResumeMismatch { target, elapsed });
        }
    }
}

/// Read a stream's full logical contents, decompressing as needed.
pub fn read_stream(dir: &Path, stream: IoStream) -> Result<Vec<u8>, IoLogError> {
    let path = dir.join(stream.file_name());
    let mut data = Vec::new();
    if restart::is_gzip(&path)? {
        MultiGzDecoder::new(File::open(&path)?).read_to_end(&mut data)?;
    } else {
        File::open(&path)?.read_to_end(&mut data)?;
    }
    Ok(data)
}

/// Factory for [`IoLogSession`]s under one storage root.
///
/// The per-parent sequence allocators are the only state shared between
/// connections; everything else is owned by the session.
pub struct IoLogStore {
    opts: IoLogStoreOptions,
    allocators: Mutex<HashMap<PathBuf, SessionIdAllocator>>,
}

impl IoLogStore {
    pub fn new(opts: IoLogStoreOptions) -> Self {
        IoLogStore {
            opts,
            allocators: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &IoLogStoreOptions {
        &self.opts
    }

    /// Create a fresh session directory for an accepted command, write its
    /// info files and open the eagerly-created streams.
    pub fn create(&self, log_info: &LogInfo) -> Result<IoLogSession, IoLogError> {
        let escapes = PathEscapes {
            user: &log_info.submit_user,
            group: &log_info.submit_group,
            runas_user: &log_info.run_user,
            runas_group: &log_info.run_group,
            hostname: &log_info.submit_host,
            command: &log_info.command,
        };
        let expanded = expand_escapes(&self.opts.pattern, &escapes)?;
        // Escape values come off the wire; keep the result under the root.
        validate_log_id(&expanded)?;

        let (log_id, dir) = if let Some(pos) = expanded.find(SEQ_TOKEN) {
            if !expanded.ends_with(SEQ_TOKEN) {
                return Err(IoLogError::BadInfo(format!(
                    "{} must be the final path component",
                    SEQ_TOKEN
                )));
            }
            let parent_rel = expanded[..pos].trim_end_matches('/');
            let parent = self.opts.root.join(parent_rel);
            let (id, dir) = match self.allocators.lock() {
                Ok(mut allocators) => allocators
                    .entry(parent.clone())
                    .or_insert_with(|| SessionIdAllocator::new(self.opts.maxseq))
                    .allocate(&parent, dir_mode(self.opts.file_mode))?,
                Err(_) => return Err(IoLogError::SequenceExhausted),
            };
            let log_id = if parent_rel.is_empty() {
                id.rel_path().to_string_lossy().into_owned()
            } else {
                format!("{}/{}", parent_rel, id.rel_path().display())
            };
            (log_id, dir)
        } else {
            let dir = self.opts.root.join(&expanded);
            fs::create_dir_all(&dir)?;
            (expanded, dir)
        };

        log_info.write(&dir, self.opts.file_mode)?;
        let timing = open_append(Path::new("timing"), &dir, self.opts.file_mode)?;
        let mut session = IoLogSession {
            dir,
            log_id,
            file_mode: self.opts.file_mode,
            compress: self.opts.compress,
            elapsed: Duration::ZERO,
            timing,
            streams: Default::default(),
        };
        info!("created I/O log {} at {}", session.log_id, session.dir.display());
        // Streams expected by replay tools are created eagerly.
        for stream in [IoStream::Stdout, IoStream::Stderr, IoStream::Ttyout] {
            session.open_stream(stream)?;
        }
        Ok(session)
    }

    /// Reopen an existing session at `resume` elapsed time, truncating or
    /// rewriting anything recorded past that point.
    pub fn restart(&self, log_id: &str, resume: Duration) -> Result<IoLogSession, IoLogError> {
        validate_log_id(log_id)?;
        let dir = self.opts.root.join(log_id);
        let timing_path = dir.join("timing");
        let meta = match fs::metadata(&timing_path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IoLogError::BadLogId(log_id.to_string()))
            }
            Err(e) => return Err(IoLogError::IoError(e)),
        };
        if meta.permissions().mode() & 0o200 == 0 {
            return Err(IoLogError::LogComplete);
        }

        let offsets = seek_to_elapsed(&dir, resume)?;
        restart::truncate_for_resume(&dir, &offsets)?;

        let timing = OpenOptions::new().append(true).open(&timing_path)?;
        info!(
            "restarted I/O log {} at [{}.{:09}], {} records kept",
            log_id,
            resume.as_secs(),
            resume.subsec_nanos(),
            offsets.records
        );
        Ok(IoLogSession {
            dir,
            log_id: log_id.to_string(),
            file_mode: self.opts.file_mode,
            compress: self.opts.compress,
            elapsed: resume,
            timing,
            streams: Default::default(),
        })
    }
}

enum StreamWriter {
    Plain(File),
    Gzip(GzEncoder<File>),
}

impl StreamWriter {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            StreamWriter::Plain(f) => f.write_all(data),
            StreamWriter::Gzip(g) => g.write_all(data),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            StreamWriter::Plain(f) => f.flush(),
            StreamWriter::Gzip(g) => g.flush(),
        }
    }

    fn finish(self) -> std::io::Result<()> {
        match self {
            StreamWriter::Plain(mut f) => f.flush(),
            StreamWriter::Gzip(g) => g.finish().map(|_| ()),
        }
    }
}

fn open_append(name: &Path, dir: &Path, mode: u32) -> std::io::Result<File> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .mode(mode)
        .open(dir.join(name))
}

/// One open session log. Appends couple the timing stream to the data
/// files: the data bytes are written first, then the timing record, so
/// the timing file never claims more than the data files hold.
pub struct IoLogSession {
    dir: PathBuf,
    log_id: String,
    file_mode: u32,
    compress: bool,
    elapsed: Duration,
    timing: File,
    streams: [Option<StreamWriter>; 5],
}

impl IoLogSession {
    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cumulative delay of every record written so far.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    fn open_stream(&mut self, stream: IoStream) -> Result<(), IoLogError> {
        let path = self.dir.join(stream.file_name());
        // A restarted log keeps each file's existing representation; fresh
        // or empty files follow the configured compression.
        let use_gzip = match fs::metadata(&path) {
            Ok(meta) if meta.len() > 0 => restart::is_gzip(&path)?,
            _ => self.compress,
        };
        let file = open_append(Path::new(stream.file_name()), &self.dir, self.file_mode)?;
        let writer = if use_gzip {
            StreamWriter::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            StreamWriter::Plain(file)
        };
        self.streams[stream.index()] = Some(writer);
        Ok(())
    }

    fn write_timing(&mut self, record: &TimingRecord) -> Result<(), IoLogError> {
        let mut line = record.format_line();
        line.push('\n');
        self.timing.write_all(line.as_bytes())?;
        self.elapsed += record.delay;
        Ok(())
    }

    /// Append captured data to a stream's file plus a timing record.
    pub fn append_io(
        &mut self,
        stream: IoStream,
        delay: Duration,
        data: &[u8],
    ) -> Result<(), IoLogError> {
        if self.streams[stream.index()].is_none() {
            self.open_stream(stream)?;
        }
        if let Some(writer) = self.streams[stream.index()].as_mut() {
            writer.write_all(data)?;
        }
        self.write_timing(&TimingRecord {
            delay,
            payload: TimingPayload::Io {
                stream,
                len: data.len() as u64,
            },
        })
    }

    pub fn append_winsize(&mut self, delay: Duration, rows: u32, cols: u32) -> Result<(), IoLogError> {
        self.write_timing(&TimingRecord {
            delay,
            payload: TimingPayload::Winsize { rows, cols },
        })
    }

    pub fn append_suspend(&mut self, delay: Duration, signal: &str) -> Result<(), IoLogError> {
        self.write_timing(&TimingRecord {
            delay,
            payload: TimingPayload::Suspend {
                signal: signal.to_string(),
            },
        })
    }

    /// Flush buffered stream data ahead of a commit-point acknowledgement.
    pub fn flush(&mut self) -> Result<(), IoLogError> {
        for writer in self.streams.iter_mut().flatten() {
            writer.flush()?;
        }
        self.timing.flush()?;
        Ok(())
    }

    /// Close every stream. When `complete`, the timing file's write bits
    /// are cleared to mark the log finished for later restart attempts.
    pub fn close(mut self, complete: bool) -> Result<(), IoLogError> {
        for slot in self.streams.iter_mut() {
            if let Some(writer) = slot.take() {
                writer.finish()?;
            }
        }
        self.timing.flush()?;
        if complete {
            let timing_path = self.dir.join("timing");
            let mut perms = fs::metadata(&timing_path)?.permissions();
            perms.set_mode(perms.mode() & !0o222);
            fs::set_permissions(&timing_path, perms)?;
            debug!("marked I/O log {} complete", self.log_id);
        }
        Ok(())
    }
}
