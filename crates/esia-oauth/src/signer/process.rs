//! Signing by shelling out to an external tool (`openssl smime` by default).
//!
//! The message goes to the tool's stdin, the DER signature is read back from
//! its stdout. Anything on stderr is only used to describe a failure.

use std::ffi::OsString;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use super::{Result, SignError, Signer};

pub const DEFAULT_TOOL: &str = "openssl";

/// Environment variable carrying the private key passphrase to the tool.
pub const PASSPHRASE_ENV: &str = "ESIA_SIGNER_PASSPHRASE";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Point in time by which the whole call, pipes included, has to finish.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    timeout: Duration,
}

/// Runs one short-lived signing process per [`Signer::sign`] call.
#[derive(Clone)]
pub struct ProcessSigner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    timeout: Option<Duration>,
}

impl ProcessSigner {
    /// Detached binary DER signing without signed attributes, i.e.
    /// `openssl smime -sign -binary -outform DER -noattr -signer <cert> -inkey <key>`.
    pub fn new(
        certificate_path: impl AsRef<Path>,
        private_key_path: impl AsRef<Path>,
        passphrase: Option<String>,
    ) -> Self {
        let mut args: Vec<OsString> = ["smime", "-sign", "-binary", "-outform", "DER", "-noattr"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push("-signer".into());
        args.push(certificate_path.as_ref().into());
        args.push("-inkey".into());
        args.push(private_key_path.as_ref().into());

        let mut envs = Vec::new();
        if let Some(passphrase) = passphrase {
            args.push("-passin".into());
            args.push(format!("env:{PASSPHRASE_ENV}").into());
            envs.push((PASSPHRASE_ENV.into(), passphrase.into()));
        }

        Self {
            program: DEFAULT_TOOL.into(),
            args,
            envs,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    /// Any command following the same stdin/stdout protocol, e.g. a wrapper
    /// around a GOST-capable signing tool.
    pub fn custom<I, A>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            envs: Vec::new(),
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    /// Use a different executable (path or name on `PATH`) with the same arguments.
    pub fn with_tool(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// `None` waits for the tool indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn run(&self, input: &[u8]) -> Result<Vec<u8>> {
        let deadline = self.timeout.map(|timeout| Deadline {
            at: Instant::now() + timeout,
            timeout,
        });
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SignError::Spawn {
                program: self.program.to_string_lossy().into(),
                source,
            })?;

        // Every pipe gets its own thread so that neither a tool that never
        // reads its input nor one that floods its output can stall the wait.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let written = feed(child.stdin.take(), input.to_vec());

        // On timeout the pipe threads are left behind; a descendant of the
        // tool may still hold the pipes open.
        let status = self.wait(&mut child, deadline)?;
        let stdout = receive(stdout, deadline);
        let stderr = receive(stderr, deadline);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            program = %self.program.display(),
            code = ?status.code(),
            "signing tool finished"
        );

        if !status.success() {
            let diagnostics = stderr.unwrap_or_default();
            return Err(SignError::failed(
                &String::from_utf8_lossy(&diagnostics),
                status.code().unwrap_or(-1),
            ));
        }
        match receive(written, deadline) {
            // The tool may legitimately stop reading early; its exit status decides.
            Err(SignError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => {}
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        stdout
    }

    fn wait(&self, child: &mut Child, deadline: Option<Deadline>) -> Result<ExitStatus> {
        let Some(deadline) = deadline else {
            return Ok(child.wait()?);
        };
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if Instant::now() < deadline.at => thread::sleep(POLL_INTERVAL),
                Ok(None) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(program = %self.program.display(), timeout = ?deadline.timeout, "killing signing tool");
                    reap(child);
                    return Err(SignError::TimedOut(deadline.timeout));
                }
                Err(e) => {
                    reap(child);
                    return Err(e.into());
                }
            }
        }
    }
}

impl Signer for ProcessSigner {
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(len = message.len())))]
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.run(message)
    }
}

impl fmt::Debug for ProcessSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSigner")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("envs", &self.envs.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn drain<R>(pipe: Option<R>) -> Receiver<io::Result<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let read = match pipe {
            Some(mut pipe) => pipe.read_to_end(&mut buf).map(|_| buf),
            None => Ok(buf),
        };
        let _ = tx.send(read);
    });
    rx
}

/// Writes `input` and closes stdin by dropping it.
fn feed(stdin: Option<ChildStdin>, input: Vec<u8>) -> Receiver<io::Result<()>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let written = match stdin {
            Some(mut stdin) => stdin.write_all(&input),
            None => Ok(()),
        };
        let _ = tx.send(written);
    });
    rx
}

fn receive<T>(rx: Receiver<io::Result<T>>, deadline: Option<Deadline>) -> Result<T> {
    let lost = || io::Error::other("pipe thread exited without a result");
    let received = match deadline {
        Some(deadline) => rx
            .recv_timeout(deadline.at.saturating_duration_since(Instant::now()))
            .map_err(|e| match e {
                RecvTimeoutError::Timeout => SignError::TimedOut(deadline.timeout),
                RecvTimeoutError::Disconnected => SignError::Io(lost()),
            })?,
        None => rx.recv().map_err(|_| lost())?,
    };
    Ok(received?)
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessSigner {
        ProcessSigner::custom("sh", ["-c", script])
    }

    #[test]
    fn default_invocation_is_detached_der_without_attributes() {
        let signer = ProcessSigner::new("/etc/esia/client.crt", "/etc/esia/client.key", None);
        assert_eq!(signer.program(), Path::new("openssl"));
        let args: Vec<_> = signer.args().iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            args,
            [
                "smime",
                "-sign",
                "-binary",
                "-outform",
                "DER",
                "-noattr",
                "-signer",
                "/etc/esia/client.crt",
                "-inkey",
                "/etc/esia/client.key",
            ]
        );
        assert_eq!(signer.timeout(), Some(DEFAULT_TIMEOUT));
    }

    #[test]
    fn passphrase_goes_through_environment() {
        let signer = ProcessSigner::new("c.crt", "k.key", Some("s3cret".into()));
        let args: Vec<_> = signer.args().iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(&args[args.len() - 2..], ["-passin", "env:ESIA_SIGNER_PASSPHRASE"]);
        assert!(!args.iter().any(|a| a.contains("s3cret")));
        assert!(!format!("{signer:?}").contains("s3cret"));
    }

    #[test]
    fn passphrase_is_visible_to_the_tool() {
        let mut signer = sh("printf %s \"$ESIA_SIGNER_PASSPHRASE\"");
        signer.envs.push((PASSPHRASE_ENV.into(), "pw".into()));
        assert_eq!(signer.sign(b"ignored").unwrap(), b"pw");
    }

    #[test]
    fn echo_tool_returns_message() {
        let signer = sh("cat");
        let message = b"openid fullname2024.01.02 03:04:05 +0300client-idstate";
        assert_eq!(signer.sign(message).unwrap(), message);
    }

    #[test]
    fn large_message_does_not_deadlock() {
        let signer = sh("cat");
        let message = vec![b'x'; 1 << 20];
        assert_eq!(signer.sign(&message).unwrap().len(), message.len());
    }

    #[test]
    fn non_zero_exit_reports_trimmed_diagnostics() {
        let signer = sh("cat >/dev/null; echo '  unable to load signing key  ' >&2; exit 1");
        let err = signer.sign(b"message").unwrap_err();
        match err {
            SignError::Failed { message, code } => {
                assert_eq!(message, "unable to load signing key");
                assert_eq!(code, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_zero_exit_without_diagnostics_is_unknown() {
        let signer = sh("exit 1");
        let err = signer.sign(b"message").unwrap_err();
        assert!(matches!(err, SignError::Failed { ref message, code: 1 } if message == "unknown"));
    }

    #[test]
    fn early_exit_before_reading_input_keeps_exit_code() {
        let signer = sh("echo bad >&2; exit 3");
        let err = signer.sign(&vec![0u8; 1 << 20]).unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
    }

    #[test]
    fn zero_exit_with_empty_output_is_an_empty_signature() {
        let signer = sh("cat >/dev/null");
        assert_eq!(signer.sign(b"message").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn diagnostics_on_success_are_ignored() {
        let signer = sh("cat; echo 'warning: weak key' >&2");
        assert_eq!(signer.sign(b"abc").unwrap(), b"abc");
    }

    #[test]
    fn missing_tool_is_a_spawn_error() {
        let signer = ProcessSigner::custom("/nonexistent/esia-signing-tool", Vec::<String>::new());
        assert!(matches!(signer.sign(b"m"), Err(SignError::Spawn { .. })));
    }

    #[test]
    fn slow_tool_is_killed_after_timeout() {
        let signer = sh("exec sleep 5").with_timeout(Some(Duration::from_millis(100)));
        let started = Instant::now();
        let err = signer.sign(b"m").unwrap_err();
        assert!(matches!(err, SignError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn tool_that_never_reads_input_still_times_out() {
        let signer = sh("exec sleep 4").with_timeout(Some(Duration::from_millis(100)));
        let started = Instant::now();
        let err = signer.sign(&vec![b'x'; 1 << 20]).unwrap_err();
        assert!(matches!(err, SignError::TimedOut(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn wrapper_with_lingering_child_still_times_out() {
        // `sh` forks `sleep`, which keeps stdout and stderr open after `sh` is killed
        let signer = sh("cat >/dev/null; sleep 4; :").with_timeout(Some(Duration::from_millis(100)));
        let started = Instant::now();
        let err = signer.sign(b"m").unwrap_err();
        assert!(matches!(err, SignError::TimedOut(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn background_child_holding_output_is_bounded_by_timeout() {
        let signer = sh("cat; sleep 4 &").with_timeout(Some(Duration::from_millis(300)));
        let started = Instant::now();
        let err = signer.sign(b"m").unwrap_err();
        assert!(matches!(err, SignError::TimedOut(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
