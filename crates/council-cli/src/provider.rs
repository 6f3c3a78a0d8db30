//! Subprocess-backed [`ProviderCall`] — the network boundary the spec
//! carves out as an external collaborator (spec §1 scope note). Each
//! attempt spawns `sh -c <command>`, writes the seat prompt to the
//! child's stdin, and reads its stdout as the seat's free-form output,
//! mirroring `tools/exec_tool.rs::RunCommandTool::call`'s
//! spawn-capture-both-streams shape from the teacher.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use coordination::orchestrator::router::{ProviderCall, ProviderSpec};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::ProviderRung;

pub struct SeatRunner {
    commands: HashMap<String, String>,
}

impl SeatRunner {
    pub fn new(rungs: &[ProviderRung]) -> Self {
        let commands = rungs.iter().map(|r| (r.spec.name.clone(), r.command.clone())).collect();
        Self { commands }
    }
}

#[async_trait]
impl ProviderCall for SeatRunner {
    async fn call(&self, spec: &ProviderSpec, prompt: &str) -> Result<String, String> {
        let template = self.commands.get(&spec.name).ok_or_else(|| format!("no command configured for provider {}", spec.name))?;
        let command = template.replace("{model}", &spec.model);

        let mut cmd = Command::new("sh");
        cmd.args(["-c", &command])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropped (e.g. the round aborts this task on a stop flag) means
            // killed, process group and all — the orchestrator's abort tick
            // is the only "SIGTERM" this boundary gets; there is no grace
            // window to hand a seat process before its slot is reclaimed.
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| format!("spawn failed: {e}"))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await.map_err(|e| format!("stdin write failed: {e}"))?;
        }

        let output = child.wait_with_output().await.map_err(|e| format!("wait failed: {e}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("exit {}: {stderr}", output.status.code().unwrap_or(-1)));
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        if text.trim().is_empty() {
            return Err("no text generated".to_string());
        }
        Ok(text)
    }
}
