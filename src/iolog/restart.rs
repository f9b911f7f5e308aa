//! Resume support: truncating or rewriting logs at a replay offset.
//!
//! Plain files are truncated in place. Compressed streams cannot be
//! truncated at a logical offset, so their prefix is re-encoded into a
//! temporary sibling directory (`restart.XXXXXX`) and renamed over the
//! original only once every staged copy has succeeded. A failure at any
//! point discards the staging directory and leaves the log untouched.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;

use crate::error_handling::types::IoLogError;
use crate::iolog::store::LogOffsets;
use crate::iolog::timing::IoStream;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// True if the file starts with the gzip magic. Empty and one-byte files
/// are plain.
pub fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut f = File::open(path)?;
    let mut magic = [0u8; 2];
    let mut read = 0;
    while read < magic.len() {
        let n = f.read(&mut magic[read..])?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(magic == GZIP_MAGIC)
}

/// Cut every stream file and the timing file back to the byte offsets
/// computed by a timing replay.
pub fn truncate_for_resume(dir: &Path, offsets: &LogOffsets) -> Result<(), IoLogError> {
    let mut staging: Option<tempfile::TempDir> = None;
    let mut renames: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut truncations: Vec<(PathBuf, u64)> = Vec::new();

    for stream in IoStream::ALL {
        let path = dir.join(stream.file_name());
        let logical = offsets.stream_bytes[stream.index()];
        match fs::metadata(&path) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if logical > 0 {
                    return Err(IoLogError::MissingStream(stream.file_name()));
                }
                continue;
            }
            Err(e) => return Err(IoLogError::IoError(e)),
        }
        if logical > 0 && is_gzip(&path)? {
            if staging.is_none() {
                let parent = dir.parent().unwrap_or(dir);
                staging = Some(
                    tempfile::Builder::new()
                        .prefix("restart.")
                        .tempdir_in(parent)?,
                );
            }
            if let Some(staging) = &staging {
                let staged = staging.path().join(stream.file_name());
                copy_gzip_prefix(&path, &staged, logical, stream.file_name())?;
                fs::set_permissions(&staged, fs::metadata(&path)?.permissions())?;
                renames.push((staged, path));
            }
        } else {
            truncations.push((path, logical));
        }
    }
    // The timing file is always plain text.
    truncations.push((dir.join("timing"), offsets.timing_bytes));

    // All staged copies succeeded; from here on only (atomic) renames and
    // truncations touch the canonical files.
    for (from, to) in renames {
        debug!("renaming rewritten {} into place", to.display());
        fs::rename(&from, &to)?;
    }
    for (path, len) in truncations {
        let f = OpenOptions::new().write(true).open(&path)?;
        f.set_len(len)?;
    }
    Ok(())
}

/// Re-encode the first `logical` uncompressed bytes of `src` into a fresh
/// gzip stream at `dst`.
fn copy_gzip_prefix(
    src: &Path,
    dst: &Path,
    logical: u64,
    stream: &'static str,
) -> Result<(), IoLogError> {
    let mut reader = MultiGzDecoder::new(File::open(src)?).take(logical);
    let out = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(dst)?;
    let mut encoder = GzEncoder::new(out, Compression::default());
    let copied = io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?;
    if copied != logical {
        return Err(IoLogError::StreamTooShort {
            stream,
            want: logical,
            have: copied,
        });
    }
    Ok(())
}
