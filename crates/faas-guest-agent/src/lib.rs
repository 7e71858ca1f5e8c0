//! In-guest side of the Firecracker provider: reads one [`GuestInvocation`]
//! per connection, runs the wrapped program and answers with a
//! [`GuestReport`].

use std::process::Stdio;

use faas_common::{GuestInvocation, GuestReport};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Vsock Bind/Accept Error: {0}")]
    VsockBind(std::io::Error),
    #[error("Vsock IO Error: {0}")]
    VsockIo(#[from] std::io::Error),
    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Command Execution Error: {0}")]
    CommandExec(String),
    #[error("Task Join Error: {0}")]
    JoinError(String),
}

fn map_join_error<T>(
    res: Result<T, tokio::task::JoinError>,
    task_name: &str,
) -> Result<T, AgentError> {
    res.map_err(|e| AgentError::JoinError(format!("{} task join error: {}", task_name, e)))
}

/// Serves one host connection: the host writes the invocation and closes its
/// write half, the agent answers with the report and closes.
pub async fn handle_connection<S>(stream: &mut S) -> Result<GuestReport, AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = Vec::new();
    stream.read_to_end(&mut buffer).await?;
    let invocation: GuestInvocation = serde_json::from_slice(&buffer)?;
    info!(invocation_id = %invocation.invocation_id, language = %invocation.language, "Received invocation");

    let report = execute(invocation).await?;

    let report_json = serde_json::to_vec(&report)?;
    stream.write_all(&report_json).await?;
    stream.shutdown().await?;
    info!(invocation_id = %report.invocation_id, "Report sent");
    Ok(report)
}

/// Runs the invocation's program to completion with its input on stdin.
pub async fn execute(invocation: GuestInvocation) -> Result<GuestReport, AgentError> {
    let (interpreter, args) = invocation.command();
    let mut command = Command::new(interpreter);
    command.args(args);
    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| AgentError::CommandExec(format!("Failed to spawn {interpreter}: {e}")))?;

    let stdin_opt = child.stdin.take();
    let stdout_opt = child.stdout.take();
    let stderr_opt = child.stderr.take();
    let payload = invocation.input;

    // Async IO Tasks
    let stdin_handle = tokio::spawn(async move {
        if let Some(mut stdin) = stdin_opt {
            match stdin.write_all(&payload).await {
                Ok(_) => stdin.shutdown().await,
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        }
    });

    let stdout_handle = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stdout) = stdout_opt {
            stdout.read_to_end(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    });

    let stderr_handle = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr_opt {
            stderr.read_to_end(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    });

    let (status_res, stdin_res, stdout_res, stderr_res) =
        tokio::join!(child.wait(), stdin_handle, stdout_handle, stderr_handle);

    let status =
        status_res.map_err(|e| AgentError::CommandExec(format!("Command wait failed: {}", e)))?;
    info!(exit_code = ?status.code(), "Command finished");

    if let Err(e) = map_join_error(stdin_res, "Stdin")? {
        // the program may exit without reading its input
        error!(error = %e, "Error writing stdin or shutting down");
    }
    let stdout = map_join_error(stdout_res, "Stdout")??;
    let stderr = map_join_error(stderr_res, "Stderr")??;

    Ok(GuestReport {
        invocation_id: invocation.invocation_id,
        exit_code: status.code().map(i64::from),
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use faas_common::Language;

    fn has_python() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn invocation(program: &str, input: &[u8]) -> GuestInvocation {
        GuestInvocation {
            invocation_id: "inv-7".into(),
            language: Language::Python,
            program: program.into(),
            input: input.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_execute_pipes_stdin_and_captures_streams() {
        if !has_python() {
            eprintln!("Test ignored: python3 not available");
            return;
        }
        let program = "import sys\ndata = sys.stdin.read()\nprint(data.upper())\nsys.stderr.write('warn')";
        let report = execute(invocation(program, b"hello")).await.unwrap();

        assert_eq!(report.invocation_id, "inv-7");
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(String::from_utf8_lossy(&report.stdout).trim(), "HELLO");
        assert_eq!(String::from_utf8_lossy(&report.stderr), "warn");
    }

    #[tokio::test]
    async fn test_handle_connection_round_trip() {
        if !has_python() {
            eprintln!("Test ignored: python3 not available");
            return;
        }
        let (mut host, mut guest) = tokio::io::duplex(64 * 1024);
        let agent = tokio::spawn(async move { handle_connection(&mut guest).await });

        let request = serde_json::to_vec(&invocation("import sys\nsys.exit(3)", b"")).unwrap();
        host.write_all(&request).await.unwrap();
        host.shutdown().await.unwrap();

        let mut answer = Vec::new();
        host.read_to_end(&mut answer).await.unwrap();
        let report: GuestReport = serde_json::from_slice(&answer).unwrap();
        assert_eq!(report.exit_code, Some(3));
        assert_eq!(agent.await.unwrap().unwrap(), report);
    }

    #[tokio::test]
    async fn test_malformed_invocation_is_rejected() {
        let (mut host, mut guest) = tokio::io::duplex(1024);
        host.write_all(b"not json").await.unwrap();
        host.shutdown().await.unwrap();

        let err = handle_connection(&mut guest).await.unwrap_err();
        assert!(matches!(err, AgentError::Serialization(_)));
    }
}
