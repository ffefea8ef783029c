use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader, Split};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::GpgOptions;
use crate::validation::HexId;

/// Flags passed on every invocation, after `--homedir <dir>`.
const GLOBAL_FLAGS: &[&str] = &["--batch", "--yes"];

/// The operations this crate knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    DeleteKey,
    ImportKey,
    Fingerprint,
    VerifyInline,
    VerifyDetached,
    SignInline,
    SignDetached,
}

/// One element of an argument template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    Flag(&'static str),
    Slot(Slot),
}

/// A substitution point in an argument template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    HexId,
    KeyFile,
    InFile,
    OutFile,
    SigFile,
}

impl Slot {
    fn name(self) -> &'static str {
        match self {
            Slot::HexId => "hex id",
            Slot::KeyFile => "key file",
            Slot::InFile => "input file",
            Slot::OutFile => "output file",
            Slot::SigFile => "signature file",
        }
    }
}

use Arg::Flag;

const DELETE_KEY: &[Arg] = &[Flag("--delete-key"), Arg::Slot(Slot::HexId)];

const IMPORT_KEY: &[Arg] = &[
    Flag("--verbose"),
    Flag("--verbose"),
    Flag("--import"),
    Arg::Slot(Slot::KeyFile),
];

const FINGERPRINT: &[Arg] = &[Flag("--fingerprint"), Arg::Slot(Slot::HexId)];

const VERIFY_INLINE: &[Arg] = &[
    Flag("--output"),
    Arg::Slot(Slot::OutFile),
    Flag("--verbose"),
    Flag("--decrypt"),
    Arg::Slot(Slot::InFile),
];

const VERIFY_DETACHED: &[Arg] = &[
    Flag("--verify"),
    Arg::Slot(Slot::SigFile),
    Arg::Slot(Slot::InFile),
];

const SIGN_INLINE: &[Arg] = &[
    Flag("--local-user"),
    Arg::Slot(Slot::HexId),
    Flag("--passphrase-fd"),
    Flag("0"),
    Flag("--output"),
    Arg::Slot(Slot::OutFile),
    Flag("--clearsign"),
    Arg::Slot(Slot::InFile),
];

const SIGN_DETACHED: &[Arg] = &[
    Flag("--local-user"),
    Arg::Slot(Slot::HexId),
    Flag("--passphrase-fd"),
    Flag("0"),
    Flag("--output"),
    Arg::Slot(Slot::OutFile),
    Flag("--armor"),
    Flag("--detach-sign"),
    Arg::Slot(Slot::InFile),
];

impl OperationKind {
    /// The fixed argument template appended after the global flags.
    pub fn template(self) -> &'static [Arg] {
        match self {
            OperationKind::DeleteKey => DELETE_KEY,
            OperationKind::ImportKey => IMPORT_KEY,
            OperationKind::Fingerprint => FINGERPRINT,
            OperationKind::VerifyInline => VERIFY_INLINE,
            OperationKind::VerifyDetached => VERIFY_DETACHED,
            OperationKind::SignInline => SIGN_INLINE,
            OperationKind::SignDetached => SIGN_DETACHED,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OperationKind::DeleteKey => "delete_key",
            OperationKind::ImportKey => "import_key",
            OperationKind::Fingerprint => "fingerprint",
            OperationKind::VerifyInline => "verify_inline",
            OperationKind::VerifyDetached => "verify_detached",
            OperationKind::SignInline => "sign_inline",
            OperationKind::SignDetached => "sign_detached",
        }
    }
}

/// Which pipes to attach to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pipes {
    /// Caller writes, gpg reads on its standard input.
    pub input: bool,
    /// Caller reads gpg's standard output and standard error, merged by line.
    pub output: bool,
}

impl Pipes {
    pub const OUTPUT: Pipes = Pipes {
        input: false,
        output: true,
    };
    pub const BOTH: Pipes = Pipes {
        input: true,
        output: true,
    };
}

/// Everything needed to launch gpg for one call.
///
/// Built fresh for each operation and never shared, so concurrent calls
/// cannot see each other's arguments.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    kind: OperationKind,
    homedir: &'a Path,
    hex_id: Option<&'a HexId>,
    key_file: Option<&'a Path>,
    in_file: Option<&'a Path>,
    out_file: Option<&'a Path>,
    sig_file: Option<&'a Path>,
}

impl<'a> Invocation<'a> {
    pub fn new(kind: OperationKind, homedir: &'a Path) -> Self {
        Self {
            kind,
            homedir,
            hex_id: None,
            key_file: None,
            in_file: None,
            out_file: None,
            sig_file: None,
        }
    }

    pub fn hex_id(mut self, hex_id: &'a HexId) -> Self {
        self.hex_id = Some(hex_id);
        self
    }

    pub fn key_file(mut self, path: &'a Path) -> Self {
        self.key_file = Some(path);
        self
    }

    pub fn in_file(mut self, path: &'a Path) -> Self {
        self.in_file = Some(path);
        self
    }

    pub fn out_file(mut self, path: &'a Path) -> Self {
        self.out_file = Some(path);
        self
    }

    pub fn sig_file(mut self, path: &'a Path) -> Self {
        self.sig_file = Some(path);
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    fn slot_value(&self, slot: Slot) -> Option<OsString> {
        match slot {
            Slot::HexId => self.hex_id.map(|id| OsString::from(id.as_str())),
            Slot::KeyFile => self.key_file.map(|p| p.as_os_str().to_owned()),
            Slot::InFile => self.in_file.map(|p| p.as_os_str().to_owned()),
            Slot::OutFile => self.out_file.map(|p| p.as_os_str().to_owned()),
            Slot::SigFile => self.sig_file.map(|p| p.as_os_str().to_owned()),
        }
    }

    /// Renders the gpg argument vector: home directory, global flags, then
    /// the operation's template with its slots filled in.
    pub fn args(&self, loopback_pinentry: bool) -> Result<Vec<OsString>> {
        let mut args = vec![
            OsString::from("--homedir"),
            self.homedir.as_os_str().to_owned(),
        ];
        args.extend(GLOBAL_FLAGS.iter().map(OsString::from));
        if loopback_pinentry {
            args.push(OsString::from("--pinentry-mode"));
            args.push(OsString::from("loopback"));
        }

        for arg in self.kind.template() {
            match *arg {
                Arg::Flag(flag) => args.push(OsString::from(flag)),
                Arg::Slot(slot) => {
                    let value = self
                        .slot_value(slot)
                        .ok_or(Error::MissingArgument(slot.name()))?;
                    args.push(value);
                }
            }
        }

        Ok(args)
    }

    /// Starts gpg with the requested pipes. The child is killed if the
    /// returned handle is dropped before it exits.
    pub fn spawn(&self, options: &GpgOptions, pipes: Pipes) -> Result<GpgProcess> {
        let args = self.args(options.loopback_pinentry)?;

        let mut cmd = Command::new(&options.program);
        cmd.env("LC_ALL", "C")
            .args(&options.program_args)
            .args(&args)
            .kill_on_drop(true)
            .stdin(if pipes.input {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        if pipes.output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = cmd.spawn()?;
        debug!(
            operation = self.kind.name(),
            pid = child.id(),
            "spawned gpg"
        );

        let input = child.stdin.take();
        let output = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => Some(OutputLines::new(stdout, stderr)),
            _ => None,
        };

        Ok(GpgProcess {
            child,
            input,
            output,
        })
    }
}

/// A running gpg child and the pipes attached to it.
pub struct GpgProcess {
    child: Child,
    input: Option<ChildStdin>,
    output: Option<OutputLines>,
}

impl GpgProcess {
    /// The write end of gpg's standard input, if it was piped.
    pub fn take_input(&mut self) -> Option<ChildStdin> {
        self.input.take()
    }

    /// The merged output reader, if output was piped.
    pub fn take_output(&mut self) -> Option<OutputLines> {
        self.output.take()
    }

    /// Closes any pipes still held and collects the exit status.
    ///
    /// Cancel safe: if the returned future is dropped, the child can still be
    /// killed and reaped with [`GpgProcess::kill`].
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        drop(self.input.take());
        drop(self.output.take());
        Ok(self.child.wait().await?)
    }

    /// Kills the child and reaps it. Used on paths that abandon the output.
    pub async fn kill(&mut self) {
        drop(self.input.take());
        drop(self.output.take());
        if let Err(err) = self.child.kill().await {
            warn!(error = %err, "failed to kill gpg");
        }
    }
}

/// Reads gpg's standard output and standard error as one line stream.
///
/// Lines from the two streams are interleaved in the order they become
/// readable; ordering across the streams is therefore approximate.
pub struct OutputLines {
    stdout: Option<Split<BufReader<ChildStdout>>>,
    stderr: Option<Split<BufReader<ChildStderr>>>,
}

impl OutputLines {
    fn new(stdout: ChildStdout, stderr: ChildStderr) -> Self {
        Self {
            stdout: Some(BufReader::new(stdout).split(b'\n')),
            stderr: Some(BufReader::new(stderr).split(b'\n')),
        }
    }

    /// Returns the next line without its terminator, or None once both
    /// streams have reached end-of-file. Invalid UTF-8 is replaced rather
    /// than treated as an error, since user IDs are not always UTF-8.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            let (segment, from_stdout) = match (&mut self.stdout, &mut self.stderr) {
                (None, None) => return Ok(None),
                (Some(out), None) => (out.next_segment().await?, true),
                (None, Some(err)) => (err.next_segment().await?, false),
                (Some(out), Some(err)) => tokio::select! {
                    segment = out.next_segment() => (segment?, true),
                    segment = err.next_segment() => (segment?, false),
                },
            };

            match segment {
                Some(segment) => {
                    let mut line = String::from_utf8_lossy(&segment).into_owned();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                    return Ok(Some(line));
                }
                None if from_stdout => self.stdout = None,
                None => self.stderr = None,
            }
        }
    }
}
