//! Wraps user code so that the sandboxed interpreter reads the input from
//! stdin, calls `main(input)` and prints a single machine-readable report.
//!
//! The report is the last stdout line starting with [`RESULT_MARKER`],
//! followed by a JSON object holding either `result` or `error`, plus the
//! interpreter's own `metrics` (`memory` in bytes, `cpu` in seconds).

use faas_common::{InvocationOutcome, Language, OutcomeKind, ResourceUsage, SandboxOutput};
use serde::Deserialize;
use serde_json::{json, Value};

pub const RESULT_MARKER: &str = "__FAAS_RESULT__";

const GENERIC_FAILURE: &str = "function execution failed";

const PYTHON_PRELUDE: &str = r#"import json
import resource
import sys
"#;

const PYTHON_EPILOGUE: &str = r#"

def __faas_usage():
    usage = resource.getrusage(resource.RUSAGE_SELF)
    return {"memory": usage.ru_maxrss * 1024, "cpu": usage.ru_utime + usage.ru_stime}


if __name__ == "__main__":
    try:
        __faas_raw = sys.stdin.read()
        __faas_input = json.loads(__faas_raw) if __faas_raw.strip() else None
        __faas_value = main(__faas_input)
        __faas_line = json.dumps({"result": __faas_value, "metrics": __faas_usage()})
    except Exception as __faas_exc:
        __faas_line = json.dumps({
            "error": "%s: %s" % (type(__faas_exc).__name__, __faas_exc),
            "metrics": __faas_usage(),
        })
        print("__FAAS_RESULT__" + __faas_line, flush=True)
        sys.exit(1)
    print("__FAAS_RESULT__" + __faas_line, flush=True)
"#;

const JAVASCRIPT_EPILOGUE: &str = r#"

const __faasUsage = () => {
  const usage = process.resourceUsage();
  return {
    memory: usage.maxRSS * 1024,
    cpu: (usage.userCPUTime + usage.systemCPUTime) / 1e6,
  };
};

let __faasRaw = '';
process.stdin.setEncoding('utf8');
process.stdin.on('data', (chunk) => {
  __faasRaw += chunk;
});
process.stdin.on('end', async () => {
  let line;
  try {
    const input = __faasRaw.trim().length ? JSON.parse(__faasRaw) : null;
    const value = await main(input);
    line = JSON.stringify({ result: value === undefined ? null : value, metrics: __faasUsage() });
  } catch (err) {
    const name = err && err.name ? err.name : 'Error';
    const message = err && err.message !== undefined ? err.message : String(err);
    line = JSON.stringify({ error: `${name}: ${message}`, metrics: __faasUsage() });
    process.exitCode = 1;
  }
  process.stdout.write('__FAAS_RESULT__' + line + '\n');
});
"#;

/// Produces the program handed to the interpreter for `code`.
pub fn wrap(language: Language, code: &str) -> String {
    match language {
        Language::Python => format!("{PYTHON_PRELUDE}\n{code}\n{PYTHON_EPILOGUE}"),
        Language::Javascript => format!("{code}\n{JAVASCRIPT_EPILOGUE}"),
    }
}

/// Interpreter argv for a wrapped program, as used by container images.
pub fn command(language: Language, program: &str) -> Vec<String> {
    let (interpreter, flag) = match language {
        Language::Python => ("python", "-c"),
        Language::Javascript => ("node", "-e"),
    };
    vec![interpreter.to_string(), flag.to_string(), program.to_string()]
}

#[derive(Debug, Deserialize)]
struct Report {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    metrics: Option<ReportedMetrics>,
}

#[derive(Debug, Default, Deserialize)]
struct ReportedMetrics {
    memory: Option<f64>,
    cpu: Option<f64>,
}

impl From<ReportedMetrics> for ResourceUsage {
    fn from(metrics: ReportedMetrics) -> Self {
        ResourceUsage {
            cpu_seconds: metrics.cpu.filter(|c| c.is_finite() && *c >= 0.0),
            peak_memory_bytes: metrics
                .memory
                .filter(|m| m.is_finite() && *m >= 0.0)
                .map(|m| m.round() as u64),
        }
    }
}

/// What the sandboxed program said about its own run.
#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
    pub outcome: InvocationOutcome,
    /// Usage reported by the interpreter itself, unmeasured if it printed
    /// no report.
    pub reported_usage: ResourceUsage,
}

/// Turns raw process output into an outcome.
///
/// A report line wins over the exit code. Without one, a clean exit is a
/// success whose value is `{"output": <stdout>}`, anything else is a user
/// code error carrying stderr.
pub fn interpret(output: &SandboxOutput) -> Interpretation {
    let stdout = output.stdout_lossy();

    if let Some(report) = find_report(&stdout) {
        let reported_usage = report.metrics.map(ResourceUsage::from).unwrap_or_default();
        let outcome = match report.error {
            Some(message) => InvocationOutcome::Failed {
                kind: OutcomeKind::UserCodeError,
                message,
            },
            None => InvocationOutcome::Returned(report.result.unwrap_or(Value::Null)),
        };
        return Interpretation {
            outcome,
            reported_usage,
        };
    }

    let outcome = if output.exited_cleanly() {
        InvocationOutcome::Returned(json!({ "output": stdout.trim_end() }))
    } else {
        let stderr = output.stderr_lossy();
        let stderr = stderr.trim();
        let message = match (stderr.is_empty(), output.exit_code) {
            (false, _) => stderr.to_string(),
            (true, Some(code)) => format!("{GENERIC_FAILURE} (exit code {code})"),
            (true, None) => GENERIC_FAILURE.to_string(),
        };
        InvocationOutcome::Failed {
            kind: OutcomeKind::UserCodeError,
            message,
        }
    };

    Interpretation {
        outcome,
        reported_usage: ResourceUsage::unmeasured(),
    }
}

fn find_report(stdout: &str) -> Option<Report> {
    stdout
        .lines()
        .rev()
        .filter_map(|line| line.trim_end().strip_prefix(RESULT_MARKER))
        .find_map(|payload| serde_json::from_str::<Report>(payload).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(exit_code: i64, stdout: &str, stderr: &str) -> SandboxOutput {
        SandboxOutput {
            exit_code: Some(exit_code),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_wrap_keeps_user_code_and_marker() {
        let code = "def main(input):\n    return input['n'] * input['n']";
        let program = wrap(Language::Python, code);
        assert!(program.contains(code));
        assert!(program.contains(RESULT_MARKER));
        assert!(program.find(code) < program.find("__faas_usage"));

        let program = wrap(Language::Javascript, "function main(i) { return i; }");
        assert!(program.starts_with("function main"));
        assert!(program.contains("process.resourceUsage"));
    }

    #[test]
    fn test_command_uses_inline_flag() {
        assert_eq!(command(Language::Python, "x")[..2], ["python", "-c"]);
        assert_eq!(command(Language::Javascript, "x")[..2], ["node", "-e"]);
    }

    #[test]
    fn test_report_with_result() {
        let out = output(
            0,
            "debug print\n__FAAS_RESULT__{\"result\": 49, \"metrics\": {\"memory\": 2048, \"cpu\": 0.02}}\n",
            "",
        );
        let interpretation = interpret(&out);
        assert_eq!(interpretation.outcome, InvocationOutcome::Returned(json!(49)));
        assert_eq!(interpretation.reported_usage.peak_memory_bytes, Some(2048));
        assert_eq!(interpretation.reported_usage.cpu_seconds, Some(0.02));
    }

    #[test]
    fn test_null_result_is_success() {
        let out = output(0, "__FAAS_RESULT__{\"result\": null}\n", "");
        let interpretation = interpret(&out);
        assert_eq!(interpretation.outcome, InvocationOutcome::Returned(Value::Null));
        assert!(interpretation.reported_usage.is_unmeasured());
    }

    #[test]
    fn test_report_with_error() {
        let out = output(
            1,
            "__FAAS_RESULT__{\"error\": \"ZeroDivisionError: division by zero\", \"metrics\": {\"memory\": 1024, \"cpu\": 0.01}}\n",
            "",
        );
        match interpret(&out).outcome {
            InvocationOutcome::Failed { kind, message } => {
                assert_eq!(kind, OutcomeKind::UserCodeError);
                assert_eq!(message, "ZeroDivisionError: division by zero");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_last_valid_report_wins() {
        let out = output(
            0,
            "__FAAS_RESULT__{\"result\": 1}\n__FAAS_RESULT__not json\n__FAAS_RESULT__{\"result\": 2}\n",
            "",
        );
        assert_eq!(interpret(&out).outcome, InvocationOutcome::Returned(json!(2)));
    }

    #[test]
    fn test_clean_exit_without_report_returns_stdout() {
        let out = output(0, "hello\n", "");
        assert_eq!(
            interpret(&out).outcome,
            InvocationOutcome::Returned(json!({ "output": "hello" }))
        );
    }

    #[test]
    fn test_crash_without_report_uses_stderr() {
        let out = output(137, "", "Killed\n");
        assert_eq!(
            interpret(&out).outcome,
            InvocationOutcome::Failed {
                kind: OutcomeKind::UserCodeError,
                message: "Killed".into()
            }
        );

        let silent = output(2, "", "");
        match interpret(&silent).outcome {
            InvocationOutcome::Failed { message, .. } => {
                assert_eq!(message, "function execution failed (exit code 2)")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
