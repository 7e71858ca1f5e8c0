//! Wire format spoken over vsock between the host and the guest agent.
//!
//! One newline-free JSON document per direction per connection: the host
//! writes a [`GuestInvocation`] and shuts down its write half, the agent
//! answers with a [`GuestReport`] and closes.

use serde::{Deserialize, Serialize};

use crate::{Language, SandboxOutput};

/// Context id the guest listens on.
pub const GUEST_CID: u32 = 3;
/// Port the guest agent binds inside the microVM.
pub const GUEST_VSOCK_PORT: u32 = 1234;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestInvocation {
    pub invocation_id: String,
    pub language: Language,
    pub program: String,
    /// Bytes piped to the program's stdin.
    pub input: Vec<u8>,
}

impl GuestInvocation {
    /// Interpreter command line for the wrapped program.
    pub fn command(&self) -> (&'static str, [&str; 2]) {
        match self.language {
            Language::Python => ("python3", ["-c", &self.program]),
            Language::Javascript => ("node", ["-e", &self.program]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestReport {
    pub invocation_id: String,
    pub exit_code: Option<i64>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl From<GuestReport> for SandboxOutput {
    fn from(report: GuestReport) -> Self {
        SandboxOutput {
            exit_code: report.exit_code,
            stdout: report.stdout,
            stderr: report.stderr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_command_per_language() {
        let mut invocation = GuestInvocation {
            invocation_id: "i-1".into(),
            language: Language::Python,
            program: "print(1)".into(),
            input: b"{}".to_vec(),
        };
        assert_eq!(invocation.command(), ("python3", ["-c", "print(1)"]));

        invocation.language = Language::Javascript;
        assert_eq!(invocation.command().0, "node");
    }

    #[test]
    fn test_report_wire_names() {
        let report = GuestReport {
            invocation_id: "i-1".into(),
            exit_code: Some(0),
            stdout: b"ok".to_vec(),
            stderr: Vec::new(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["invocationId"], "i-1");
        assert_eq!(json["exitCode"], 0);

        let output = SandboxOutput::from(report);
        assert!(output.exited_cleanly());
        assert_eq!(output.stdout_lossy(), "ok");
    }
}
