//! Child-process plumbing shared by the local and SSH transports.

use std::borrow::Cow;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use super::{ReplicationTransport, SnapshotStream, TransportError, TransportErrorKind};

// ============================================================================
// LocalTransport
// ============================================================================

/// Runs commands on this host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

impl LocalTransport {
    fn command(argv: &[&str]) -> Result<Command, TransportError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| TransportError::new(TransportErrorKind::Other, "empty command line"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

#[async_trait]
impl ReplicationTransport for LocalTransport {
    fn endpoint(&self) -> &str {
        "local"
    }

    async fn execute(&self, argv: &[&str]) -> Result<String, TransportError> {
        let output = run(Self::command(argv)?, &describe(argv, self.endpoint())).await?;
        Ok(output.stdout)
    }

    async fn open(&self, argv: &[&str]) -> Result<SnapshotStream, TransportError> {
        open(Self::command(argv)?, describe(argv, self.endpoint()))
    }

    async fn deliver(&self, argv: &[&str], stream: SnapshotStream) -> Result<u64, TransportError> {
        deliver(Self::command(argv)?, &describe(argv, self.endpoint()), stream).await
    }
}

// ============================================================================
// SshTransport
// ============================================================================

/// Runs commands on a remote host through `ssh` in batch mode.
#[derive(Debug, Clone)]
pub struct SshTransport {
    destination: String,
    port: u16,
    identity: Option<PathBuf>,
    options: Vec<String>,
}

impl SshTransport {
    pub fn new(host: &str, user: &str) -> Self {
        Self {
            destination: format!("{user}@{host}"),
            port: 22,
            identity: None,
            options: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity(mut self, key: impl Into<PathBuf>) -> Self {
        self.identity = Some(key.into());
        self
    }

    /// Extra `-o` option, e.g. `StrictHostKeyChecking=accept-new`.
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    /// The `ssh` invocation that runs `argv` remotely.
    pub fn ssh_args(&self, argv: &[&str]) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if let Some(key) = &self.identity {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push("-p".to_string());
        args.push(self.port.to_string());
        for option in &self.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.push(self.destination.clone());
        args.push("--".to_string());
        args.push(
            argv.iter()
                .map(|a| shell_quote(a))
                .collect::<Vec<_>>()
                .join(" "),
        );
        args
    }

    fn command(&self, argv: &[&str]) -> Result<Command, TransportError> {
        if argv.is_empty() {
            return Err(TransportError::new(
                TransportErrorKind::Other,
                "empty command line",
            ));
        }
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args(argv));
        Ok(cmd)
    }
}

#[async_trait]
impl ReplicationTransport for SshTransport {
    fn endpoint(&self) -> &str {
        &self.destination
    }

    async fn execute(&self, argv: &[&str]) -> Result<String, TransportError> {
        let output = run(self.command(argv)?, &describe(argv, self.endpoint())).await?;
        Ok(output.stdout)
    }

    async fn open(&self, argv: &[&str]) -> Result<SnapshotStream, TransportError> {
        open(self.command(argv)?, describe(argv, self.endpoint()))
    }

    async fn deliver(&self, argv: &[&str], stream: SnapshotStream) -> Result<u64, TransportError> {
        deliver(self.command(argv)?, &describe(argv, self.endpoint()), stream).await
    }
}

/// Quote one argument for a POSIX shell.
pub fn shell_quote(arg: &str) -> Cow<'_, str> {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c));
    if safe {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}

// ============================================================================
// Process helpers
// ============================================================================

pub(crate) struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

fn describe(argv: &[&str], endpoint: &str) -> String {
    let program = argv.iter().take(2).copied().collect::<Vec<_>>().join(" ");
    format!("{program} ({endpoint})")
}

/// Run to completion. Non-zero exit becomes a classified error.
pub(crate) async fn run(mut cmd: Command, what: &str) -> Result<CommandOutput, TransportError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = %what, "Running command");
    let output = cmd
        .output()
        .await
        .map_err(|e| TransportError::spawn(what, e))?;

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(TransportError::from_output(what, &stderr));
    }

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr,
    })
}

fn open(mut cmd: Command, what: String) -> Result<SnapshotStream, TransportError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = %what, "Opening command stream");
    let mut child = cmd.spawn().map_err(|e| TransportError::spawn(&what, e))?;
    let stdout = child.stdout.take().ok_or_else(|| {
        TransportError::new(TransportErrorKind::Other, format!("{what}: stdout not captured"))
    })?;
    let stderr = tokio::spawn(read_all(child.stderr.take()));

    // The child moves into the completion future; dropping it kills the process.
    let completion = async move {
        let status = child
            .wait()
            .await
            .map_err(|e| TransportError::spawn(&what, e))?;
        let stderr = stderr.await.unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(TransportError::from_output(&what, &stderr))
        }
    };

    Ok(SnapshotStream::new(stdout, completion))
}

async fn deliver(
    mut cmd: Command,
    what: &str,
    stream: SnapshotStream,
) -> Result<u64, TransportError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = %what, "Delivering stream");
    let mut child = cmd.spawn().map_err(|e| TransportError::spawn(what, e))?;
    let mut stdin = child.stdin.take().ok_or_else(|| {
        TransportError::new(TransportErrorKind::Other, format!("{what}: stdin not captured"))
    })?;
    let stderr = tokio::spawn(read_all(child.stderr.take()));
    let stdout = tokio::spawn(read_all(child.stdout.take()));

    let (mut reader, source_done) = stream.into_parts();
    let copied = tokio::io::copy(&mut reader, &mut stdin).await;
    // Closing both ends lets the receiver see EOF and unblocks a stalled sender.
    drop(stdin);
    drop(reader);

    let status = child
        .wait()
        .await
        .map_err(|e| TransportError::spawn(what, e))?;
    let stderr = stderr.await.unwrap_or_default();
    let _ = stdout.await;
    let source = source_done.await;

    match (status.success(), source) {
        (true, Ok(())) => copied.map_err(|e| {
            TransportError::new(
                TransportErrorKind::Connectivity,
                format!("{what}: stream interrupted: {e}"),
            )
        }),
        (true, Err(e)) => Err(e),
        // A truncated stream makes the receiver fail generically; the sender knows why.
        (false, Err(e)) if TransportErrorKind::from_output(&stderr) == TransportErrorKind::Other => {
            Err(e)
        }
        (false, _) => Err(TransportError::from_output(what, &stderr)),
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut out = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut out).await;
    }
    out
}
