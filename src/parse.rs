use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::types::{KeyData, KeyType};

/// Bumped whenever a pattern below changes, so callers logging the version
/// can tell which gpg output dialect a result was parsed with.
pub const PATTERN_TABLE_VERSION: u32 = 1;

/// Unmatched lines kept for error messages.
const MAX_DIAGNOSTIC_LINES: usize = 20;

/// Fragments naming a permission or missing-file failure. Lines carrying one
/// outlive the diagnostic tail so errors can still be classified by them.
const CAUSE_MARKERS: &[&str] = &[
    "Permission denied",
    "permission denied",
    "No such file or directory",
];

const IMPORTED: &str = r"^gpg:[ \t]+imported: 1";
const PUBLIC_KEY: &str = r"^gpg: key ([[:xdigit:]]{8}): public key";
const USER_ID: &str = r#"^:user ID packet:[ \t]+"(.+)"$"#;
const KEY_PACKET: &str = r"^:public key packet:";
const KEY_ALGO: &str = r"^[ \t]+version [0-9]+, algo ([0-9]+),";
const KEY_BITS: &str = r"^[ \t]+pkey\[0\]: \[([0-9]+) bits\]";
const FINGERPRINT: &str = r"^[ \t]+Key fingerprint = ([[:xdigit:] ]+)$";
const GOOD_SIGNATURE: &str = r"^gpg: Good signature ";
const BAD_SIGNATURE: &str = r"^gpg: BAD signature";
const SIGNATURE_KEY: &str = r"^gpg: Signature made.*key ID ([[:xdigit:]]{8})$";

/// Every regular expression applied to gpg output.
pub struct PatternTable {
    imported: Regex,
    public_key: Regex,
    user_id: Regex,
    key_packet: Regex,
    key_algo: Regex,
    key_bits: Regex,
    fingerprint: Regex,
    good_signature: Regex,
    bad_signature: Regex,
    signature_key: Regex,
}

impl PatternTable {
    fn compile() -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            imported: Regex::new(IMPORTED)?,
            public_key: Regex::new(PUBLIC_KEY)?,
            user_id: Regex::new(USER_ID)?,
            key_packet: Regex::new(KEY_PACKET)?,
            key_algo: Regex::new(KEY_ALGO)?,
            key_bits: Regex::new(KEY_BITS)?,
            fingerprint: Regex::new(FINGERPRINT)?,
            good_signature: Regex::new(GOOD_SIGNATURE)?,
            bad_signature: Regex::new(BAD_SIGNATURE)?,
            signature_key: Regex::new(SIGNATURE_KEY)?,
        })
    }
}

static PATTERNS: LazyLock<std::result::Result<PatternTable, regex::Error>> =
    LazyLock::new(PatternTable::compile);

/// The process-wide pattern table, compiled on first use.
pub fn patterns() -> Result<&'static PatternTable> {
    PATTERNS.as_ref().map_err(|e| Error::Pattern(e.clone()))
}

/// Which group of patterns a scan applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternSet {
    /// No patterns; every line is kept as a diagnostic.
    None,
    Import,
    Fingerprint,
    Verify,
}

/// What one pass over gpg's output found.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub data: KeyData,
    /// `imported: 1` was seen.
    pub imported: bool,
    /// `Good signature` was seen.
    pub good_signature: bool,
    /// `BAD signature` was seen.
    pub bad_signature: bool,
    causes: Vec<String>,
    unmatched: VecDeque<String>,
}

impl ScanOutcome {
    /// The last few lines that matched no pattern, preceded by any earlier
    /// unmatched line reporting a permission or missing-file failure.
    pub fn diagnostics(&self) -> String {
        self.causes
            .iter()
            .chain(&self.unmatched)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn keep_unmatched(&mut self, line: &str) {
        if self.unmatched.len() == MAX_DIAGNOSTIC_LINES
            && let Some(evicted) = self.unmatched.pop_front()
            && self.causes.len() < MAX_DIAGNOSTIC_LINES
            && CAUSE_MARKERS.iter().any(|marker| evicted.contains(marker))
        {
            self.causes.push(evicted);
        }
        self.unmatched.push_back(line.to_string());
    }
}

#[derive(Default)]
struct PendingKeyType {
    algorithm: Option<String>,
    bits: Option<u32>,
}

/// Applies one pattern set to gpg output, a line at a time.
///
/// Success markers are tested before extraction patterns and the first
/// matching pattern claims the line.
pub struct Scanner {
    patterns: &'static PatternTable,
    set: PatternSet,
    outcome: ScanOutcome,
    pending_key_type: Option<PendingKeyType>,
    seen_key_packet: bool,
}

impl Scanner {
    pub fn new(set: PatternSet) -> Result<Self> {
        Ok(Self {
            patterns: patterns()?,
            set,
            outcome: ScanOutcome::default(),
            pending_key_type: None,
            seen_key_packet: false,
        })
    }

    pub fn feed(&mut self, line: &str) {
        let matched = match self.set {
            PatternSet::None => false,
            PatternSet::Import => self.feed_import(line),
            PatternSet::Fingerprint => self.feed_fingerprint(line),
            PatternSet::Verify => self.feed_verify(line),
        };

        if !matched {
            trace!(line, "unmatched gpg output");
            self.outcome.keep_unmatched(line);
        }
    }

    pub fn finish(self) -> ScanOutcome {
        self.outcome
    }

    fn feed_import(&mut self, line: &str) -> bool {
        let p = self.patterns;

        if p.imported.is_match(line) {
            self.outcome.imported = true;
            return true;
        }

        if let Some(caps) = p.public_key.captures(line) {
            let hex_id = caps[1].to_string();
            debug!(hex_id = %hex_id, "captured public key ID");
            self.outcome.data.hex_ids.push(hex_id);
            return true;
        }

        if let Some(caps) = p.user_id.captures(line) {
            let owner = caps[1].to_string();
            debug!(owner = %owner, "captured user ID");
            self.outcome.data.owners.push(owner);
            return true;
        }

        self.feed_key_type(line)
    }

    // Only the first public key packet is described; later packets belong to
    // subkeys or further keys in the same file.
    fn feed_key_type(&mut self, line: &str) -> bool {
        let p = self.patterns;

        if p.key_packet.is_match(line) {
            if !self.seen_key_packet {
                self.seen_key_packet = true;
                self.pending_key_type = Some(PendingKeyType::default());
            }
            return true;
        }

        let Some(pending) = self.pending_key_type.as_mut() else {
            return false;
        };

        if let Some(caps) = p.key_algo.captures(line) {
            pending.algorithm = Some(parse_algorithm(&caps[1]));
        } else if let Some(caps) = p.key_bits.captures(line) {
            pending.bits = caps[1].parse().ok();
        } else {
            return false;
        }

        if let Some(PendingKeyType {
            algorithm: Some(algorithm),
            bits: Some(bits),
        }) = self.pending_key_type.take_if(|k| k.algorithm.is_some() && k.bits.is_some())
        {
            self.outcome.data.key_type = Some(KeyType { algorithm, bits });
        }

        true
    }

    fn feed_fingerprint(&mut self, line: &str) -> bool {
        match self.patterns.fingerprint.captures(line) {
            Some(caps) => {
                let fingerprint = caps[1].trim_end().to_string();
                debug!(fingerprint = %fingerprint, "captured fingerprint");
                self.outcome.data.fingerprints.push(fingerprint);
                true
            }
            None => false,
        }
    }

    fn feed_verify(&mut self, line: &str) -> bool {
        let p = self.patterns;

        if p.good_signature.is_match(line) {
            self.outcome.good_signature = true;
            return true;
        }

        if p.bad_signature.is_match(line) {
            self.outcome.bad_signature = true;
            return true;
        }

        if let Some(caps) = p.signature_key.captures(line) {
            let hex_id = caps[1].to_string();
            debug!(hex_id = %hex_id, "captured signer key ID");
            self.outcome.data.hex_ids.push(hex_id);
            return true;
        }

        false
    }
}

fn parse_algorithm(code: &str) -> String {
    match code {
        "1" => "RSA".to_string(),
        "2" => "RSA".to_string(),
        "3" => "RSA".to_string(),
        "16" => "Elgamal".to_string(),
        "17" => "DSA".to_string(),
        "18" => "ECDH".to_string(),
        "19" => "ECDSA".to_string(),
        "20" => "Elgamal".to_string(),
        "22" => "EdDSA".to_string(),
        _ => format!("ALG{}", code),
    }
}
