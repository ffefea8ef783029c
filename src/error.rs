use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("command execution failed: {0}")]
    Command(#[from] io::Error),

    #[error("gpg exited with status {status}: {stderr}")]
    Gpg { status: i32, stderr: String },

    #[error("invalid key ID '{keyid}': {reason}")]
    InvalidKeyId { keyid: String, reason: String },

    #[error("invalid {what} path '{}': {reason}", path.display())]
    InvalidPath {
        what: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("missing {0} argument for gpg invocation")]
    MissingArgument(&'static str),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("keyring not initialized")]
    KeyringNotInitialized,

    #[error("permission denied")]
    PermissionDenied,

    #[error("key import not confirmed: {0}")]
    ImportNotConfirmed(String),

    #[error("bad signature (signer key IDs: {signers:?})")]
    BadSignature { signers: Vec<String> },

    #[error("signature could not be verified (signer key IDs: {signers:?})")]
    UnverifiedSignature { signers: Vec<String> },

    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("failed to capture output from subprocess")]
    OutputCaptureFailed,

    #[error("failed to open input pipe to subprocess")]
    InputCaptureFailed,

    #[error("invalid output pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
