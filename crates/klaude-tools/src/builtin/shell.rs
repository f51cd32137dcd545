// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::context::ToolContext;
use crate::safety::SafetyDecision;
use crate::tool::{ConcurrencyPolicy, Tool, ToolOutput};

/// Runs a command through `bash -lc` in the session working directory with
/// the standard process environment.  Commands are checked against the
/// `CommandSafety` evaluator before spawning.
pub struct BashTool {
    pub timeout_secs: u64,
}

impl Default for BashTool {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

#[derive(Deserialize)]
struct BashArgs {
    command: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "Bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace and return its combined \
         stdout/stderr. The command runs under `bash -lc` with the standard \
         environment. Long outputs are truncated; the full output is saved \
         to the session's artifacts directory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command to execute"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Optional timeout override in seconds"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn concurrency(&self) -> ConcurrencyPolicy {
        ConcurrencyPolicy::SerialAfterSideEffects
    }

    fn has_side_effects(&self) -> bool {
        true
    }

    async fn call(&self, arguments: &str, ctx: &ToolContext) -> ToolOutput {
        let args: BashArgs = match serde_json::from_str(arguments) {
            Ok(a) => a,
            Err(e) => return ToolOutput::err(format!("Invalid arguments: {e}")),
        };

        if ctx.safety.decide(&args.command) == SafetyDecision::Deny {
            return ToolOutput::err(format!(
                "Command refused by safety policy: {}",
                args.command
            ));
        }

        debug!(command = %args.command, "running shell command");
        let mut child = match tokio::process::Command::new("bash")
            .arg("-lc")
            .arg(&args.command)
            .current_dir(&ctx.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(format!("Failed to spawn command: {e}")),
        };

        let mut stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");
        let timeout = Duration::from_secs(args.timeout_secs.unwrap_or(self.timeout_secs));

        let gather = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let _ = tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
            let status = child.wait().await;
            (out, err, status)
        };

        let (out, err, status) = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                // kill_on_drop reaps the child when `child` goes out of scope.
                return ToolOutput::aborted();
            }
            result = tokio::time::timeout(timeout, gather) => match result {
                Ok(r) => r,
                Err(_) => {
                    return ToolOutput::err(format!(
                        "Command timed out after {}s: {}",
                        timeout.as_secs(),
                        args.command
                    ));
                }
            },
        };

        let mut text = String::from_utf8_lossy(&out).to_string();
        let err_text = String::from_utf8_lossy(&err);
        if !err_text.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&err_text);
        }

        match status {
            Ok(code) if code.success() => ToolOutput::ok(text),
            Ok(code) => {
                let code = code.code().unwrap_or(-1);
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&format!("(exit code {code})"));
                ToolOutput::err(text)
            }
            Err(e) => ToolOutput::err(format!("Failed to wait for command: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
