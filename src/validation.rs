use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

/// A validated short key ID in canonical `0x`-prefixed form.
///
/// The hex digits keep the case they were given in; only the prefix is
/// added when missing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HexId(String);

impl HexId {
    /// The canonical form, always starting with `0x` or `0X`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The eight hex digits without the prefix.
    pub fn digits(&self) -> &str {
        &self.0[2..]
    }
}

impl fmt::Display for HexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for HexId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Returns true if `hexid` is a well-formed short key ID.
///
/// Accepted formats:
/// - 8 hex characters, either case
/// - the same with a "0x" or "0X" prefix
pub fn is_hex_id(hexid: &str) -> bool {
    let digits = hexid
        .strip_prefix("0x")
        .or_else(|| hexid.strip_prefix("0X"))
        .unwrap_or(hexid);

    digits.len() == 8 && digits.chars().all(|c| c.is_ascii_hexdigit())
}

/// Validates a short key ID before passing it to the subprocess.
///
/// Returns the canonical form: input that already carries a `0x`/`0X`
/// prefix is kept verbatim, otherwise `0x` is prepended.
pub fn validate_hex_id(hexid: &str) -> Result<HexId> {
    if hexid.is_empty() {
        return Err(Error::InvalidKeyId {
            keyid: hexid.to_string(),
            reason: "key ID cannot be empty".to_string(),
        });
    }

    let prefixed = hexid.starts_with("0x") || hexid.starts_with("0X");
    let digits = if prefixed { &hexid[2..] } else { hexid };

    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidKeyId {
            keyid: hexid.to_string(),
            reason: "key ID must contain only hexadecimal characters".to_string(),
        });
    }

    if digits.len() != 8 {
        return Err(Error::InvalidKeyId {
            keyid: hexid.to_string(),
            reason: format!("key ID must be 8 hex characters (got {})", digits.len()),
        });
    }

    if prefixed {
        Ok(HexId(hexid.to_string()))
    } else {
        Ok(HexId(format!("0x{hexid}")))
    }
}

/// Rejects an empty path before it reaches the argument vector.
pub fn validate_path<'a>(path: &'a Path, what: &'static str) -> Result<&'a Path> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidPath {
            what,
            path: path.to_path_buf(),
            reason: "path cannot be empty".to_string(),
        });
    }

    Ok(path)
}
