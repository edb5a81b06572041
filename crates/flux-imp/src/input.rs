//! Launch request acquisition.
//!
//! The request arrives as a JSON object `{"J": "<envelope>"}` on stdin,
//! or on the stdout of the command named by `FLUX_IMP_EXEC_HELPER`. The
//! helper is spawned without a shell: its value is split on whitespace
//! into an argv, and a nonzero helper exit aborts the launch.

use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};

use crate::error::ImpError;

/// Environment variable naming the input helper command.
pub const EXEC_HELPER_ENV: &str = "FLUX_IMP_EXEC_HELPER";

/// Upper bound on request text read from stdin or the helper.
const MAX_INPUT: u64 = 4 * 1024 * 1024;

/// The exec request bundle that crosses the privsep channel.
///
/// `args` is the full shell argv: `args[0]` is the shell path itself,
/// mirroring the command line `flux-imp exec <shell_path> <arg>...`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// The signed authorization envelope.
    #[serde(rename = "J")]
    pub token: String,

    /// Absolute path to the job shell binary.
    pub shell_path: PathBuf,

    /// Shell argv, `args[0]` included.
    pub args: Vec<String>,
}

/// The caller-supplied JSON object. Unknown keys are tolerated so the
/// scheduler can extend the request without breaking older IMPs.
#[derive(Debug, Deserialize)]
struct RequestInput {
    #[serde(rename = "J")]
    token: String,
}

/// Builds the exec request from the command line and the JSON input
/// source (stdin or helper).
pub fn read_request(shell_path: &Path, args: &[String]) -> Result<ExecRequest, ImpError> {
    let text = match env::var(EXEC_HELPER_ENV) {
        Ok(helper) if helper.is_empty() => {
            return Err(ImpError::InputMalformed(format!(
                "{EXEC_HELPER_ENV} is empty"
            )));
        }
        Ok(helper) => run_helper(&helper)?,
        Err(_) => read_stdin()?,
    };
    let input = parse_request(&text)?;

    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(shell_path.display().to_string());
    argv.extend(args.iter().cloned());

    Ok(ExecRequest {
        token: input.token,
        shell_path: shell_path.to_path_buf(),
        args: argv,
    })
}

fn parse_request(text: &str) -> Result<RequestInput, ImpError> {
    serde_json::from_str(text)
        .map_err(|e| ImpError::InputMalformed(format!("invalid json input: {e}")))
}

fn read_stdin() -> Result<String, ImpError> {
    let mut text = String::new();
    std::io::stdin()
        .lock()
        .take(MAX_INPUT)
        .read_to_string(&mut text)
        .map_err(|e| ImpError::io("read stdin", e))?;
    Ok(text)
}

/// Runs the helper command and captures its stdout.
///
/// No shell is involved: the helper value is whitespace-split into an
/// argv directly, so metacharacters have no effect.
fn run_helper(helper: &str) -> Result<String, ImpError> {
    let argv: Vec<&str> = helper.split_whitespace().collect();
    let Some((program, rest)) = argv.split_first() else {
        return Err(ImpError::InputMalformed(format!(
            "{EXEC_HELPER_ENV} is empty"
        )));
    };

    let output = Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .output()
        .map_err(|e| ImpError::io(format!("failed to invoke helper: {helper}"), e))?;

    if !output.status.success() {
        return Err(ImpError::InputMalformed(format!(
            "helper {helper} failed with status {}",
            output.status
        )));
    }
    String::from_utf8(output.stdout)
        .map_err(|_| ImpError::InputMalformed("helper output is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_built_from_json_and_argv() {
        let input = parse_request(r#"{"J": "abc.def.none"}"#).unwrap();
        assert_eq!(input.token, "abc.def.none");
    }

    #[test]
    fn extra_json_keys_tolerated() {
        let input = parse_request(r#"{"J": "t", "future": {"x": 1}}"#).unwrap();
        assert_eq!(input.token, "t");
    }

    #[test]
    fn missing_token_rejected() {
        assert!(parse_request(r#"{"job": "t"}"#).is_err());
        assert!(parse_request("not json").is_err());
        assert!(parse_request("").is_err());
    }

    #[test]
    fn argv_zero_is_the_shell() {
        // Build the argv part without consulting stdin.
        let shell = Path::new("/bin/sh");
        let args = vec!["arg1".to_string(), "arg2".to_string()];
        let mut argv = vec![shell.display().to_string()];
        argv.extend(args.iter().cloned());
        assert_eq!(argv, vec!["/bin/sh", "arg1", "arg2"]);
    }

    #[test]
    fn request_bundle_serde_round_trip() {
        let request = ExecRequest {
            token: "h.p.none".to_string(),
            shell_path: PathBuf::from("/bin/true"),
            args: vec!["/bin/true".to_string(), "arg".to_string()],
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"J\""));
        let parsed: ExecRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn helper_success_output_captured() {
        let text = run_helper("echo {\"J\":\"tok\"}").unwrap();
        assert_eq!(text.trim(), "{\"J\":\"tok\"}");
    }

    #[test]
    fn helper_nonzero_status_fatal() {
        assert!(matches!(
            run_helper("false"),
            Err(ImpError::InputMalformed(_))
        ));
    }

    #[test]
    fn helper_missing_binary_fatal() {
        assert!(matches!(
            run_helper("/nonexistent/helper-xyz"),
            Err(ImpError::Io { .. })
        ));
    }
}
