use std::ffi::OsString;

/// Key information gathered from one gpg invocation.
///
/// Each sequence keeps the order in which gpg printed the values and keeps
/// duplicates. A `KeyData` returned from a successful operation was filled by
/// exactly one pass over gpg's output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyData {
    /// Algorithm and size of the first public key packet, when gpg dumped one.
    pub key_type: Option<KeyType>,
    /// Reserved; never set from gpg output.
    pub is_signing_key: bool,
    /// Short (8 hex digit) key IDs, without a `0x` prefix.
    pub hex_ids: Vec<String>,
    /// User IDs, e.g. `Alice <alice@example.org>`.
    pub owners: Vec<String>,
    /// Fingerprints as printed by gpg, in space-separated groups.
    pub fingerprints: Vec<String>,
}

impl KeyData {
    pub fn is_empty(&self) -> bool {
        self.key_type.is_none()
            && !self.is_signing_key
            && self.hex_ids.is_empty()
            && self.owners.is_empty()
            && self.fingerprints.is_empty()
    }
}

/// The cryptographic algorithm and key size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyType {
    pub algorithm: String,
    pub bits: u32,
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.algorithm.to_lowercase(), self.bits)
    }
}

/// Options controlling how gpg is launched.
#[derive(Debug, Clone)]
pub struct GpgOptions {
    /// The program to run. Defaults to `gpg`, resolved through `PATH`.
    pub program: OsString,
    /// Arguments placed before any gpg flag, for when `program` is a wrapper
    /// (for example `sudo -u signer gpg`).
    pub program_args: Vec<OsString>,
    /// Time gpg may run in a single operation, in seconds, counted from
    /// spawn. On expiry gpg is killed and reaped before the call returns.
    /// If None, no timeout is applied and a hung gpg blocks the call.
    pub timeout_secs: Option<u64>,
    /// Pass `--pinentry-mode loopback`, which GnuPG 2.1 and later require
    /// before they accept a passphrase on `--passphrase-fd`.
    pub loopback_pinentry: bool,
}

impl Default for GpgOptions {
    fn default() -> Self {
        Self {
            program: OsString::from("gpg"),
            program_args: Vec::new(),
            timeout_secs: None,
            loopback_pinentry: false,
        }
    }
}
