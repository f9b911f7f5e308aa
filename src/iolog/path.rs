//! Session directory naming: escape expansion and sequence allocation.

use std::fmt;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use log::debug;
use regex::Regex;

use crate::error_handling::types::IoLogError;

static ESCAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%\{([a-z_]+)\}|%%").unwrap());

/// Values substituted for `%{...}` tokens in the session path pattern.
/// `%{seq}` is not expanded here; see [`SessionIdAllocator`].
#[derive(Debug, Clone, Copy)]
pub struct PathEscapes<'a> {
    pub user: &'a str,
    pub group: &'a str,
    pub runas_user: &'a str,
    pub runas_group: &'a str,
    pub hostname: &'a str,
    pub command: &'a str,
}

/// Expand every `%{...}` token in `pattern` except `%{seq}`, which is left
/// in place for the caller. `%%` collapses to a literal percent sign.
/// Unknown tokens are an error.
pub fn expand_escapes(pattern: &str, esc: &PathEscapes) -> Result<String, IoLogError> {
    let mut out = String::with_capacity(pattern.len());
    let mut last = 0;
    for caps in ESCAPE_RE.captures_iter(pattern) {
        let m = match caps.get(0) {
            Some(m) => m,
            None => continue,
        };
        out.push_str(&pattern[last..m.start()]);
        last = m.end();
        match caps.get(1).map(|t| t.as_str()) {
            None => out.push('%'),
            Some("seq") => out.push_str("%{seq}"),
            Some("user") => out.push_str(esc.user),
            Some("group") => out.push_str(esc.group),
            Some("runas_user") => out.push_str(esc.runas_user),
            Some("runas_group") => out.push_str(esc.runas_group),
            Some("hostname") => out.push_str(esc.hostname),
            // Command basename only; the full path would add directory levels.
            Some("command") => {
                let base = esc.command.rsplit('/').next().unwrap_or(esc.command);
                out.push_str(base);
            }
            Some(other) => {
                return Err(IoLogError::BadInfo(format!("unknown escape %{{{}}}", other)))
            }
        }
    }
    out.push_str(&pattern[last..]);
    Ok(out)
}

/// Number of distinct session ids (six base-36 digits).
pub const SESSID_SPACE: u64 = 36u64.pow(6);

const ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A six-character session id, rendered on disk as a three-level
/// directory path (`aa/bb/cc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId([u8; 6]);

impl SessionId {
    pub fn from_counter(n: u64) -> Option<SessionId> {
        if n >= SESSID_SPACE {
            return None;
        }
        let mut chars = [ALPHABET[0]; 6];
        let mut rem = n;
        for slot in chars.iter_mut().rev() {
            *slot = ALPHABET[(rem % 36) as usize];
            rem /= 36;
        }
        Some(SessionId(chars))
    }

    pub fn as_str(&self) -> &str {
        // ALPHABET is pure ASCII.
        std::str::from_utf8(&self.0).unwrap_or("??????")
    }

    /// Relative directory path, e.g. `aa/bb/cc`.
    pub fn rel_path(&self) -> PathBuf {
        let s = self.as_str();
        PathBuf::from(format!("{}/{}/{}", &s[0..2], &s[2..4], &s[4..6]))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Allocates session ids by directory creation.
///
/// Ids are tried in counter order; an id whose directory already exists is
/// skipped and never reused. `mkdir` atomicity is the only guard, there is
/// no lock and no on-disk counter.
pub struct SessionIdAllocator {
    next: u64,
    max: u64,
}

impl SessionIdAllocator {
    pub fn new(maxseq: u64) -> Self {
        SessionIdAllocator {
            next: 0,
            max: maxseq.min(SESSID_SPACE),
        }
    }

    /// Create the directory for the next unused id under `parent` and
    /// return the id with the created path.
    pub fn allocate(
        &mut self,
        parent: &Path,
        dir_mode: u32,
    ) -> Result<(SessionId, PathBuf), IoLogError> {
        std::fs::create_dir_all(parent)?;
        let mut builder = DirBuilder::new();
        builder.mode(dir_mode);
        for _ in 0..self.max {
            if self.next >= self.max {
                // Recycle the sequence space; existing logs are skipped below.
                self.next = 0;
            }
            let id = SessionId::from_counter(self.next).ok_or(IoLogError::SequenceExhausted)?;
            self.next += 1;
            let path = parent.join(id.rel_path());
            if let Some(p) = path.parent() {
                std::fs::create_dir_all(p)?;
            }
            match builder.create(&path) {
                Ok(()) => {
                    debug!("allocated session id {} at {}", id, path.display());
                    return Ok((id, path));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(IoLogError::IoError(e)),
            }
        }
        Err(IoLogError::SequenceExhausted)
    }
}

/// Validate a caller-supplied log id before it is joined to the storage
/// root. Absolute paths and parent references are rejected.
pub fn validate_log_id(id: &str) -> Result<(), IoLogError> {
    if id.is_empty() || id.len() > 4096 || id.contains('\0') {
        return Err(IoLogError::BadLogId(id.into()));
    }
    let path = Path::new(id);
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(IoLogError::BadLogId(id.into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn escapes() -> PathEscapes<'static> {
        PathEscapes {
            user: "alice",
            group: "staff",
            runas_user: "root",
            runas_group: "wheel",
            hostname: "buildbox",
            command: "/usr/bin/make",
        }
    }

    #[test]
    fn expands_all_tokens() {
        let out = expand_escapes(
            "%{hostname}/%{user}:%{group}/%{runas_user}:%{runas_group}/%{command}",
            &escapes(),
        )
        .unwrap();
        assert_eq!(out, "buildbox/alice:staff/root:wheel/make");
    }

    #[test]
    fn seq_token_passes_through() {
        let out = expand_escapes("%{user}/%{seq}", &escapes()).unwrap();
        assert_eq!(out, "alice/%{seq}");
    }

    #[test]
    fn percent_literal_and_unknown_token() {
        assert_eq!(expand_escapes("a%%b", &escapes()).unwrap(), "a%b");
        assert!(expand_escapes("%{bogus}", &escapes()).is_err());
    }

    #[test]
    fn session_id_rendering() {
        let id = SessionId::from_counter(0).unwrap();
        assert_eq!(id.as_str(), "aaaaaa");
        assert_eq!(id.rel_path(), PathBuf::from("aa/aa/aa"));
        let id = SessionId::from_counter(1).unwrap();
        assert_eq!(id.rel_path(), PathBuf::from("aa/aa/ab"));
        let id = SessionId::from_counter(36).unwrap();
        assert_eq!(id.rel_path(), PathBuf::from("aa/aa/ba"));
        let id = SessionId::from_counter(SESSID_SPACE - 1).unwrap();
        assert_eq!(id.as_str(), "999999");
        assert!(SessionId::from_counter(SESSID_SPACE).is_none());
    }

    #[test]
    fn allocator_is_monotonic_and_skips_existing() {
        let root = TempDir::new().unwrap();
        let mut alloc = SessionIdAllocator::new(SESSID_SPACE);
        let (id, path) = alloc.allocate(root.path(), 0o700).unwrap();
        assert_eq!(id.as_str(), "aaaaaa");
        assert!(path.ends_with("aa/aa/aa"));
        let (id, _) = alloc.allocate(root.path(), 0o700).unwrap();
        assert_eq!(id.as_str(), "aaaaab");

        // A fresh allocator must not hand out ids that exist on disk.
        let mut alloc = SessionIdAllocator::new(SESSID_SPACE);
        let (id, _) = alloc.allocate(root.path(), 0o700).unwrap();
        assert_eq!(id.as_str(), "aaaaac");
    }

    #[test]
    fn log_id_validation() {
        assert!(validate_log_id("aa/bb/cc").is_ok());
        assert!(validate_log_id("custom-name").is_ok());
        assert!(validate_log_id("").is_err());
        assert!(validate_log_id("/etc/passwd").is_err());
        assert!(validate_log_id("aa/../../etc").is_err());
    }
}
