//! Docker backend: no VMM control socket, no vsock — `exec`/`stop` are
//! plain CLI shellouts. Kept distinct from the vsock-backed drivers so the
//! resilience stack doesn't pretend a container has a guest agent.

use super::{HypervisorDriver, InstanceInfo, StartSpec};
use crate::error::{Error, Result};
use async_trait::async_trait;
use shared::agent_protocol::ExecResult;
use tokio::process::Command;

pub struct DockerDriver {
    container_name: Option<String>,
    image_reference: String,
    pid: Option<u32>,
    running: bool,
}

impl DockerDriver {
    pub fn new(image_reference: String) -> Self {
        Self { container_name: None, image_reference, pid: None, running: false }
    }

    async fn run_docker(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::DockerCli(format!("failed to spawn docker: {e}")))?;

        if !output.status.success() {
            return Err(Error::DockerCli(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl HypervisorDriver for DockerDriver {
    async fn start(&mut self, spec: &StartSpec) -> Result<u32> {
        let name = format!("hyperfleet-{}", spec.tap_device);
        let id = self
            .run_docker(&[
                "run",
                "-d",
                "--name",
                &name,
                "--cpus",
                &spec.vcpu_count.to_string(),
                "--memory",
                &format!("{}m", spec.mem_size_mib),
                &self.image_reference,
            ])
            .await?;

        let pid_str = self
            .run_docker(&["inspect", "-f", "{{.State.Pid}}", &id])
            .await?;
        let pid: u32 = pid_str
            .parse()
            .map_err(|_| Error::DockerCli(format!("unparsable container pid: {pid_str:?}")))?;

        self.container_name = Some(name);
        self.pid = Some(pid);
        self.running = true;
        Ok(pid)
    }

    async fn stop(&mut self, grace_ms: u64) -> Result<()> {
        let name = self
            .container_name
            .as_ref()
            .ok_or_else(|| Error::DockerCli("not started".into()))?;
        let grace_s = (grace_ms / 1000).max(1).to_string();
        self.run_docker(&["stop", "-t", &grace_s, name]).await?;
        self.running = false;
        self.pid = None;
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        let name = self
            .container_name
            .as_ref()
            .ok_or_else(|| Error::DockerCli("not started".into()))?;
        self.run_docker(&["pause", name]).await.map(|_| ())
    }

    async fn resume(&mut self) -> Result<()> {
        let name = self
            .container_name
            .as_ref()
            .ok_or_else(|| Error::DockerCli("not started".into()))?;
        self.run_docker(&["unpause", name]).await.map(|_| ())
    }

    async fn exec(&self, cmd: Vec<String>, _timeout_ms: u64) -> Result<ExecResult> {
        let name = self
            .container_name
            .as_ref()
            .ok_or_else(|| Error::DockerCli("not started".into()))?;
        let mut args = vec!["exec".to_string(), name.clone()];
        args.extend(cmd);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = Command::new("docker")
            .args(&arg_refs)
            .output()
            .await
            .map_err(|e| Error::DockerCli(format!("failed to spawn docker exec: {e}")))?;

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn wait(&mut self) -> Result<i32> {
        let name = self
            .container_name
            .as_ref()
            .ok_or_else(|| Error::DockerCli("not started".into()))?;
        let code = self.run_docker(&["wait", name]).await?;
        self.running = false;
        code.parse().map_err(|_| Error::DockerCli(format!("unparsable exit code: {code:?}")))
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn get_pid(&self) -> Option<u32> {
        self.pid
    }

    fn get_info(&self) -> InstanceInfo {
        InstanceInfo { pid: self.pid, is_running: self.running }
    }
}
