use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::launch::{GpgProcess, Invocation, OperationKind, OutputLines, Pipes};
use crate::parse::{PATTERN_TABLE_VERSION, PatternSet, ScanOutcome, Scanner};
use crate::types::{GpgOptions, KeyData};
use crate::validation::{validate_hex_id, validate_path};

type RingLocks = HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>;

static RING_LOCKS: LazyLock<Mutex<RingLocks>> = LazyLock::new(Default::default);

/// Returns the lock serializing ring mutations for `homedir` within this
/// process. Other processes touching the same ring are not excluded.
async fn ring_lock(homedir: &Path) -> Arc<tokio::sync::Mutex<()>> {
    let key = tokio::fs::canonicalize(homedir)
        .await
        .unwrap_or_else(|_| homedir.to_path_buf());
    let mut locks = RING_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    // Entries held only by the registry have no mutation in flight.
    locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    Arc::clone(locks.entry(key).or_default())
}

/// Interface for operations that never modify the key ring.
///
/// Covers fingerprint lookup, signature verification and signing. This type
/// is returned by [`Keyring::with_homedir`]; adding and deleting keys
/// requires a [`Keyring`].
///
/// # Example
///
/// ```no_run
/// # async fn example() -> gpg_ring::Result<()> {
/// use gpg_ring::Keyring;
///
/// let reader = Keyring::with_homedir("/var/lib/app/gnupg");
/// let data = reader.fingerprint("0xDEADBEEF").await?;
/// println!("{:?}", data.fingerprints);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ReadOnlyKeyring {
    homedir: PathBuf,
    options: GpgOptions,
}

impl ReadOnlyKeyring {
    pub fn new(homedir: impl Into<PathBuf>, options: GpgOptions) -> Self {
        Self {
            homedir: homedir.into(),
            options,
        }
    }

    /// The gpg home directory holding the ring.
    pub fn homedir(&self) -> &Path {
        &self.homedir
    }

    /// Looks up the fingerprint of the key with short ID `hex_id`.
    ///
    /// Every fingerprint gpg prints (primary key and subkeys) is returned in
    /// order. The key ID itself, without its `0x` prefix, is returned as the
    /// only entry of `hex_ids`.
    pub async fn fingerprint(&self, hex_id: &str) -> Result<KeyData> {
        self.run(OperationKind::Fingerprint, async {
            let hex_id = validate_hex_id(hex_id)?;
            let invocation =
                Invocation::new(OperationKind::Fingerprint, &self.homedir).hex_id(&hex_id);
            let (status, outcome) = self.scan(invocation, PatternSet::Fingerprint).await?;

            if outcome.data.fingerprints.is_empty() {
                return Err(self
                    .environment_error(status, &outcome)
                    .unwrap_or_else(|| Error::KeyNotFound(hex_id.to_string())));
            }
            self.check_status(status, &outcome)?;

            let mut data = outcome.data;
            data.hex_ids.push(hex_id.digits().to_string());
            Ok(data)
        })
        .await
    }

    /// Verifies a file carrying an inline (clearsigned or compressed)
    /// signature, writing the signed content to `output_file`.
    ///
    /// gpg must be able to write `output_file`; if it cannot, a correctly
    /// signed file is reported as [`Error::Gpg`].
    pub async fn verify_inline(&self, signed_file: &Path, output_file: &Path) -> Result<KeyData> {
        self.run(OperationKind::VerifyInline, async {
            validate_path(signed_file, "signed file")?;
            validate_path(output_file, "output file")?;

            let invocation = Invocation::new(OperationKind::VerifyInline, &self.homedir)
                .in_file(signed_file)
                .out_file(output_file);
            self.verify(invocation).await
        })
        .await
    }

    /// Verifies `file` against the detached signature in `signature_file`.
    pub async fn verify_detached(&self, file: &Path, signature_file: &Path) -> Result<KeyData> {
        self.run(OperationKind::VerifyDetached, async {
            validate_path(file, "signed file")?;
            validate_path(signature_file, "signature file")?;

            let invocation = Invocation::new(OperationKind::VerifyDetached, &self.homedir)
                .in_file(file)
                .sig_file(signature_file);
            self.verify(invocation).await
        })
        .await
    }

    /// Clearsigns `file` with the secret key `signer`, writing the result to
    /// `output_file`.
    ///
    /// On failure `output_file` is removed so no partial signature is left
    /// behind.
    pub async fn sign_inline(
        &self,
        signer: &str,
        passphrase: &str,
        file: &Path,
        output_file: &Path,
    ) -> Result<()> {
        self.sign(OperationKind::SignInline, signer, passphrase, file, output_file)
            .await
    }

    /// Writes an armored detached signature of `file` to `signature_file`.
    ///
    /// On failure `signature_file` is removed.
    pub async fn sign_detached(
        &self,
        signer: &str,
        passphrase: &str,
        file: &Path,
        signature_file: &Path,
    ) -> Result<()> {
        self.sign(
            OperationKind::SignDetached,
            signer,
            passphrase,
            file,
            signature_file,
        )
        .await
    }

    async fn verify(&self, invocation: Invocation<'_>) -> Result<KeyData> {
        let (status, outcome) = self.scan(invocation, PatternSet::Verify).await?;

        if outcome.bad_signature {
            return Err(Error::BadSignature {
                signers: outcome.data.hex_ids,
            });
        }

        if !outcome.good_signature {
            if let Some(err) = self.environment_error(status, &outcome) {
                return Err(err);
            }
            return Err(Error::UnverifiedSignature {
                signers: outcome.data.hex_ids,
            });
        }

        self.check_status(status, &outcome)?;
        Ok(outcome.data)
    }

    async fn sign(
        &self,
        kind: OperationKind,
        signer: &str,
        passphrase: &str,
        file: &Path,
        output_file: &Path,
    ) -> Result<()> {
        let result = self
            .run(kind, async {
                validate_path(file, "input file")?;
                validate_path(output_file, "output file")?;
                let signer = validate_hex_id(signer)?;

                let invocation = Invocation::new(kind, &self.homedir)
                    .hex_id(&signer)
                    .in_file(file)
                    .out_file(output_file);
                self.feed_passphrase(invocation, passphrase).await
            })
            .await;

        if let Err(err) = &result
            && !is_invalid_input(err)
        {
            remove_output(output_file).await;
        }

        result
    }

    /// Runs gpg with the passphrase on its standard input and waits for it.
    async fn feed_passphrase(&self, invocation: Invocation<'_>, passphrase: &str) -> Result<()> {
        let mut scanner = Scanner::new(PatternSet::None)?;
        let deadline = self.deadline();
        let mut process = invocation.spawn(&self.options, Pipes::BOTH)?;

        let Some(input) = process.take_input() else {
            process.kill().await;
            return Err(Error::InputCaptureFailed);
        };
        let Some(mut output) = process.take_output() else {
            process.kill().await;
            return Err(Error::OutputCaptureFailed);
        };

        let secret = Zeroizing::new(passphrase.as_bytes().to_vec());
        let exchanged = self
            .bounded(deadline, exchange(input, secret, &mut output, &mut scanner))
            .await;
        drop(output);
        let written = match exchanged {
            Ok(written) => written,
            Err(err) => {
                process.kill().await;
                return Err(err);
            }
        };

        let status = self.reap(&mut process, deadline).await?;
        let outcome = scanner.finish();
        self.check_status(status, &outcome)?;

        // gpg exiting cleanly without reading the whole passphrase is not
        // treated as a failure; any other write error is.
        match written {
            Err(err) if err.kind() != io::ErrorKind::BrokenPipe => Err(err.into()),
            _ => Ok(()),
        }
    }

    /// Spawns gpg with its output piped, feeds every line to a scanner for
    /// `set`, then collects the exit status.
    async fn scan(
        &self,
        invocation: Invocation<'_>,
        set: PatternSet,
    ) -> Result<(ExitStatus, ScanOutcome)> {
        let mut scanner = Scanner::new(set)?;
        let deadline = self.deadline();
        let mut process = invocation.spawn(&self.options, Pipes::OUTPUT)?;

        let Some(mut output) = process.take_output() else {
            process.kill().await;
            return Err(Error::OutputCaptureFailed);
        };

        debug!(
            operation = invocation.kind().name(),
            pattern_table = PATTERN_TABLE_VERSION,
            "scanning gpg output"
        );
        let drained = self
            .bounded(deadline, drain(&mut output, &mut scanner))
            .await;
        drop(output);
        if let Err(err) = drained {
            process.kill().await;
            return Err(err);
        }

        let status = self.reap(&mut process, deadline).await?;
        Ok((status, scanner.finish()))
    }

    /// When a gpg spawned now has to be finished by, if a timeout is set.
    fn deadline(&self) -> Option<Instant> {
        self.options
            .timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs))
    }

    /// Awaits one step of talking to gpg, failing with [`Error::Timeout`]
    /// once `deadline` has passed. The caller still owns the child and must
    /// kill it on error.
    async fn bounded<T>(
        &self,
        deadline: Option<Instant>,
        step: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match (deadline, self.options.timeout_secs) {
            (Some(deadline), Some(secs)) => tokio::time::timeout_at(deadline, step)
                .await
                .unwrap_or_else(|_| Err(Error::Timeout(secs))),
            _ => step.await,
        }
    }

    /// Collects the exit status of `process`, killing and reaping it instead
    /// if `deadline` passes first.
    async fn reap(
        &self,
        process: &mut GpgProcess,
        deadline: Option<Instant>,
    ) -> Result<ExitStatus> {
        let status = self.bounded(deadline, process.wait()).await;
        if status.is_err() {
            process.kill().await;
        }
        status
    }

    /// Logs failures of an operation.
    async fn run<T, F>(&self, kind: OperationKind, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let result = operation.await;

        if let Err(err) = &result {
            error!(
                operation = kind.name(),
                homedir = %self.homedir.display(),
                error = %err,
                "gpg operation failed"
            );
        }

        result
    }

    fn check_status(&self, status: ExitStatus, outcome: &ScanOutcome) -> Result<()> {
        if status.success() {
            return Ok(());
        }
        Err(check_gpg_error(
            &self.homedir,
            status,
            &outcome.diagnostics(),
        ))
    }

    /// A failed exit caused by the environment rather than by the request.
    fn environment_error(&self, status: ExitStatus, outcome: &ScanOutcome) -> Option<Error> {
        match self.check_status(status, outcome) {
            Err(err @ (Error::PermissionDenied | Error::KeyringNotInitialized)) => Some(err),
            _ => None,
        }
    }
}

async fn drain(output: &mut OutputLines, scanner: &mut Scanner) -> Result<()> {
    while let Some(line) = output.next_line().await? {
        scanner.feed(&line);
    }
    Ok(())
}

/// Writes `secret` to gpg's standard input while draining its output, so
/// gpg never stalls on a full output pipe before reading the passphrase.
/// The outer result is the drain; the inner one is the write.
async fn exchange(
    mut input: ChildStdin,
    secret: Zeroizing<Vec<u8>>,
    output: &mut OutputLines,
    scanner: &mut Scanner,
) -> Result<io::Result<()>> {
    let write = async move {
        let written = input.write_all(&secret).await;
        drop(input);
        written
    };
    let (written, drained) = tokio::join!(write, drain(output, scanner));
    drained.map(|()| written)
}

fn is_invalid_input(err: &Error) -> bool {
    matches!(
        err,
        Error::InvalidKeyId { .. } | Error::InvalidPath { .. } | Error::MissingArgument(_)
    )
}

async fn remove_output(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed output of failed signing"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(
            path = %path.display(),
            error = %err,
            "failed to remove output of failed signing"
        ),
    }
}

fn check_gpg_error(homedir: &Path, status: ExitStatus, output: &str) -> Error {
    if output.contains("Permission denied") || output.contains("permission denied") {
        return Error::PermissionDenied;
    }

    if output.contains("No such file or directory")
        && output.contains(homedir.to_string_lossy().as_ref())
    {
        return Error::KeyringNotInitialized;
    }

    Error::Gpg {
        status: status.code().unwrap_or(-1),
        stderr: output.to_string(),
    }
}

/// Interface for managing a gpg key ring.
///
/// Adds key import and deletion to everything [`ReadOnlyKeyring`] offers.
/// Imports and deletions on the same home directory are serialized within
/// this process. Serializing them across processes is up to the caller.
///
/// None of the operations are transactional: a gpg crash half-way through an
/// import can leave the ring partially updated.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use gpg_ring::Keyring;
///
/// # async fn example() -> gpg_ring::Result<()> {
/// let keyring = Keyring::new("/var/lib/app/gnupg");
/// let data = keyring.import_key(Path::new("alice.asc")).await?;
/// println!("imported {:?} owned by {:?}", data.hex_ids, data.owners);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Keyring {
    reader: ReadOnlyKeyring,
}

impl Keyring {
    /// Creates a Keyring for `homedir` with default options.
    #[must_use]
    pub fn new(homedir: impl Into<PathBuf>) -> Self {
        Self::with_options(homedir, GpgOptions::default())
    }

    #[must_use]
    pub fn with_options(homedir: impl Into<PathBuf>, options: GpgOptions) -> Self {
        Self {
            reader: ReadOnlyKeyring::new(homedir, options),
        }
    }

    /// Creates a read-only interface for a gpg home directory.
    ///
    /// Returns a [`ReadOnlyKeyring`] that cannot add or delete keys, which
    /// is useful for verifying against a ring that must not change.
    #[must_use]
    pub fn with_homedir(path: impl Into<PathBuf>) -> ReadOnlyKeyring {
        ReadOnlyKeyring::new(path, GpgOptions::default())
    }

    /// The gpg home directory holding the ring.
    pub fn homedir(&self) -> &Path {
        self.reader.homedir()
    }

    /// Looks up the fingerprint of the key with short ID `hex_id`.
    ///
    /// See [`ReadOnlyKeyring::fingerprint`].
    pub async fn fingerprint(&self, hex_id: &str) -> Result<KeyData> {
        self.reader.fingerprint(hex_id).await
    }

    /// Verifies a file carrying an inline signature, writing the signed
    /// content to `output_file`.
    ///
    /// See [`ReadOnlyKeyring::verify_inline`].
    pub async fn verify_inline(&self, signed_file: &Path, output_file: &Path) -> Result<KeyData> {
        self.reader.verify_inline(signed_file, output_file).await
    }

    /// Verifies `file` against the detached signature in `signature_file`.
    ///
    /// See [`ReadOnlyKeyring::verify_detached`].
    pub async fn verify_detached(&self, file: &Path, signature_file: &Path) -> Result<KeyData> {
        self.reader.verify_detached(file, signature_file).await
    }

    /// Clearsigns `file` with the secret key `signer`.
    ///
    /// See [`ReadOnlyKeyring::sign_inline`].
    pub async fn sign_inline(
        &self,
        signer: &str,
        passphrase: &str,
        file: &Path,
        output_file: &Path,
    ) -> Result<()> {
        self.reader
            .sign_inline(signer, passphrase, file, output_file)
            .await
    }

    /// Writes an armored detached signature of `file` to `signature_file`.
    ///
    /// See [`ReadOnlyKeyring::sign_detached`].
    pub async fn sign_detached(
        &self,
        signer: &str,
        passphrase: &str,
        file: &Path,
        signature_file: &Path,
    ) -> Result<()> {
        self.reader
            .sign_detached(signer, passphrase, file, signature_file)
            .await
    }

    /// Deletes the public key with short ID `hex_id` from the ring.
    pub async fn delete_key(&self, hex_id: &str) -> Result<()> {
        let reader = &self.reader;
        reader
            .run(OperationKind::DeleteKey, async {
                let hex_id = validate_hex_id(hex_id)?;
                let lock = ring_lock(&reader.homedir).await;
                let _guard = lock.lock().await;

                let invocation =
                    Invocation::new(OperationKind::DeleteKey, &reader.homedir).hex_id(&hex_id);
                let (status, outcome) = reader.scan(invocation, PatternSet::None).await?;
                reader.check_status(status, &outcome)
            })
            .await
    }

    /// Imports the key(s) in `key_file` and reports what was imported.
    ///
    /// Succeeds only if gpg confirmed the import and its output named at
    /// least one key ID and one user ID.
    pub async fn import_key(&self, key_file: &Path) -> Result<KeyData> {
        self.reader
            .run(OperationKind::ImportKey, async {
                let outcome = self.import(key_file).await?;

                if outcome.data.hex_ids.is_empty() {
                    return Err(Error::ImportNotConfirmed(
                        "no key ID in gpg output".to_string(),
                    ));
                }
                if outcome.data.owners.is_empty() {
                    return Err(Error::ImportNotConfirmed(
                        "no user ID in gpg output".to_string(),
                    ));
                }

                Ok(outcome.data)
            })
            .await
    }

    /// Imports the key(s) in `key_file`, requiring only gpg's confirmation.
    pub async fn add_key(&self, key_file: &Path) -> Result<()> {
        self.reader
            .run(OperationKind::ImportKey, async {
                self.import(key_file).await.map(|_| ())
            })
            .await
    }

    async fn import(&self, key_file: &Path) -> Result<ScanOutcome> {
        let reader = &self.reader;
        validate_path(key_file, "key file")?;

        let lock = ring_lock(&reader.homedir).await;
        let _guard = lock.lock().await;

        let invocation =
            Invocation::new(OperationKind::ImportKey, &reader.homedir).key_file(key_file);
        let (status, outcome) = reader.scan(invocation, PatternSet::Import).await?;
        reader.check_status(status, &outcome)?;

        if !outcome.imported {
            return Err(Error::ImportNotConfirmed(format!(
                "gpg did not report an imported key: {}",
                outcome.diagnostics()
            )));
        }

        Ok(outcome)
    }
}
