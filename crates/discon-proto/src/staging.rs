//! File-staging helpers shared by the client shim (which assigns server-side
//! paths) and the sandbox host (which validates them before writing).

use std::borrow::Cow;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Prefix of every server-assigned staged-file name. Names carrying it are
/// already staged and must never be rewritten again.
pub const STAGED_PREFIX: &str = "input_";

const FORBIDDEN_PATTERNS: [&str; 8] = ["../", "/..", "~", "$", "|", ";", "&", "\\"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StagingError {
    #[error("filename contains invalid pattern: {0}")]
    ForbiddenPattern(&'static str),
    #[error("filename must not contain path separators")]
    NotABasename,
    #[error("filename is empty")]
    Empty,
}

/// Returns the logical string inside a fixed-capacity NUL-padded buffer: the
/// bytes up to the first zero byte, or the whole buffer if none.
pub fn cstr_slice(buf: &[u8]) -> &[u8] {
    match buf.iter().position(|b| *b == 0) {
        Some(i) => &buf[..i],
        None => buf,
    }
}

/// Lossy string view of a NUL-padded buffer, for logs and messages.
pub fn cstr_str(buf: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(cstr_slice(buf))
}

/// Derives the server-side path for a staged file: `input_<8-hex>_<basename>`
/// where the hex is the leading 8 characters of SHA-256 over
/// `content || basename`. Deterministic in `(content, name)`, which is what
/// makes per-session staging dedup stable.
pub fn generate_server_path(content: &[u8], original_name: &str) -> String {
    let base = basename(original_name);
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.update(base.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}{}_{}", STAGED_PREFIX, &digest[..8], base)
}

/// Checks a proposed staged-file path before anything is written. NUL bytes
/// are stripped first; the remainder must be free of traversal or shell
/// metacharacters and must be a pure basename.
pub fn validate_server_path(name: &str) -> Result<(), StagingError> {
    let cleaned: String = name.chars().filter(|c| *c != '\0').collect();
    if cleaned.is_empty() {
        return Err(StagingError::Empty);
    }
    for pattern in FORBIDDEN_PATTERNS {
        if cleaned.contains(pattern) {
            return Err(StagingError::ForbiddenPattern(pattern));
        }
    }
    if cleaned.contains('/') {
        return Err(StagingError::NotABasename);
    }
    Ok(())
}

pub fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_path_is_deterministic() {
        let a = generate_server_path(b"content", "dir/servo.cfg");
        let b = generate_server_path(b"content", "other/servo.cfg");
        assert_eq!(a, b);
        assert!(a.starts_with("input_"));
        assert!(a.ends_with("_servo.cfg"));
        // input_ + 8 hex + _ + basename
        assert_eq!(a.len(), 6 + 8 + 1 + "servo.cfg".len());
    }

    #[test]
    fn server_path_varies_with_content_and_name() {
        let a = generate_server_path(b"content", "servo.cfg");
        assert_ne!(a, generate_server_path(b"contents", "servo.cfg"));
        assert_ne!(a, generate_server_path(b"content", "servo2.cfg"));
    }

    #[test]
    fn validate_accepts_basenames() {
        for name in ["servo.cfg", "input_12ab34cd_servo.cfg", "a", "weird name.txt"] {
            assert_eq!(validate_server_path(name), Ok(()), "{name}");
        }
        // NUL padding from the wire buffer is stripped before checking.
        assert_eq!(validate_server_path("servo.cfg\0\0"), Ok(()));
    }

    #[test]
    fn validate_rejects_suspicious_patterns() {
        let cases = [
            "../etc/passwd",
            "/..",
            "~root",
            "$HOME",
            "a|b",
            "a;b",
            "a&b",
            "a\\b",
            "..\0/x",
        ];
        for name in cases {
            assert!(
                matches!(
                    validate_server_path(name),
                    Err(StagingError::ForbiddenPattern(_))
                ),
                "{name:?}"
            );
        }
        assert_eq!(
            validate_server_path("dir/servo.cfg"),
            Err(StagingError::NotABasename)
        );
        assert_eq!(validate_server_path(""), Err(StagingError::Empty));
        assert_eq!(validate_server_path("\0\0"), Err(StagingError::Empty));
    }

    #[test]
    fn cstr_honors_first_nul() {
        assert_eq!(cstr_slice(b"abc\0def"), b"abc");
        assert_eq!(cstr_slice(b"abc"), b"abc");
        assert_eq!(cstr_slice(b"\0"), b"");
        assert_eq!(cstr_str(b"input.txt\0\0\0"), "input.txt");
    }
}
