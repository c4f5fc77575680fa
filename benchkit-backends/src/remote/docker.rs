//! Container launcher built on the `docker` CLI.

use super::client::ServerClient;
use super::launcher::{GenerateParameters, InferenceServer, LaunchSpec, ServerLauncher};
use async_trait::async_trait;
use benchkit_core::{BackendError, Result};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

const LOG_TAIL_LINES: &str = "50";
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Starts servers with `docker run` and stops them with `docker stop`.
#[derive(Debug, Clone)]
pub struct DockerLauncher {
    binary: String,
}

impl Default for DockerLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerLauncher {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Use another docker-compatible CLI (`podman`, an absolute path, ...).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn host_port(&self, name: &str, spec: &LaunchSpec) -> Result<(String, u16)> {
        let Some(mapping) = spec.ports.first() else {
            return Err(BackendError::configuration(
                "inference server needs at least one published port",
            ));
        };
        if mapping.host_port != 0 {
            return Ok((mapping.host_ip.clone(), mapping.host_port));
        }

        let output = run(
            &self.binary,
            &["port".to_string(), name.to_string(), format!("{}/tcp", mapping.container_port)],
        )
        .await?;
        let port = output
            .lines()
            .filter_map(|line| line.trim().rsplit_once(':'))
            .find_map(|(_, port)| port.parse::<u16>().ok())
            .ok_or_else(|| {
                BackendError::server(format!("could not parse published port of {name}: {output}"))
            })?;
        Ok((mapping.host_ip.clone(), port))
    }

    async fn logs(&self, name: &str) -> String {
        run(
            &self.binary,
            &[
                "logs".to_string(),
                "--tail".to_string(),
                LOG_TAIL_LINES.to_string(),
                name.to_string(),
            ],
        )
        .await
        .unwrap_or_else(|e| format!("<logs unavailable: {e}>"))
    }

    /// False once the container has exited. `--rm` removes it, so a failed
    /// inspect counts as exited too.
    async fn is_running(&self, name: &str) -> bool {
        let state = run(
            &self.binary,
            &[
                "inspect".to_string(),
                "-f".to_string(),
                "{{.State.Running}}".to_string(),
                name.to_string(),
            ],
        )
        .await;
        matches!(state.as_deref(), Ok("true"))
    }

    /// Poll `/health` until it succeeds, the container exits or `timeout` elapses.
    async fn wait_until_ready(
        &self,
        name: &str,
        client: &ServerClient,
        timeout: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            if client.is_healthy().await {
                debug!(name, elapsed_ms = started.elapsed().as_millis() as u64, "Server healthy");
                return Ok(());
            }
            if !self.is_running(name).await {
                return Err(BackendError::server(format!(
                    "container {name} exited before becoming healthy"
                )));
            }
            if started.elapsed() >= timeout {
                return Err(BackendError::server(format!(
                    "server at {} not healthy after {}s",
                    client.base_url(),
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }
}

/// Arguments of `docker run` for `spec`.
pub fn run_args(name: &str, spec: &LaunchSpec) -> Vec<String> {
    let mut args: Vec<String> = ["run", "-d", "--rm", "--name", name, "--shm-size", "1g"]
        .into_iter()
        .map(String::from)
        .collect();
    if let Some(gpus) = &spec.gpus {
        args.extend(["--gpus".to_string(), gpus.clone()]);
    }
    for device in &spec.devices {
        args.extend(["--device".to_string(), device.clone()]);
    }
    for volume in &spec.volumes {
        args.extend([
            "-v".to_string(),
            format!("{}:{}:{}", volume.host.display(), volume.bind, volume.mode),
        ]);
    }
    for (key, value) in &spec.environment {
        args.extend(["-e".to_string(), format!("{key}={value}")]);
    }
    for port in &spec.ports {
        let host_port = match port.host_port {
            0 => String::new(),
            p => p.to_string(),
        };
        args.extend([
            "-p".to_string(),
            format!("{}:{}:{}", port.host_ip, host_port, port.container_port),
        ]);
    }
    args.push(spec.image.clone());
    args.extend(spec.args.iter().cloned());
    args
}

async fn run(binary: &str, args: &[String]) -> Result<String> {
    debug!(binary, ?args, "Running container command");
    let output = Command::new(binary)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackendError::server(format!(
            "{binary} {} failed (exit {}): {}",
            args.first().map(String::as_str).unwrap_or_default(),
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl ServerLauncher for DockerLauncher {
    type Server = DockerServer;

    async fn launch(&self, spec: &LaunchSpec) -> Result<DockerServer> {
        let name = format!("benchkit-{}", Uuid::new_v4());
        info!(name, image = %spec.image, model = %spec.model, flavor = %spec.flavor, "Starting inference server");

        let container_id = run(&self.binary, &run_args(&name, spec))
            .await
            .map_err(|e| BackendError::upstream(format!("server {name}"), e))?;
        debug!(name, container_id, "Container started");

        let mut server = DockerServer {
            name: name.clone(),
            binary: self.binary.clone(),
            client: ServerClient::new(String::new()),
            running: true,
        };

        let ready = async {
            let (host, port) = self.host_port(&name, spec).await?;
            let client = ServerClient::new(format!("http://{host}:{port}"));
            self.wait_until_ready(&name, &client, spec.startup_timeout)
                .await?;
            Ok::<_, BackendError>(client)
        }
        .await;

        match ready {
            Ok(client) => {
                info!(name, url = client.base_url(), "Inference server ready");
                server.client = client;
                Ok(server)
            }
            Err(e) => {
                let logs = self.logs(&name).await;
                warn!(name, error = %e, "Inference server failed to start");
                if let Err(stop_err) = server.close().await {
                    warn!(name, error = %stop_err, "Could not stop failed server");
                }
                Err(BackendError::upstream(
                    format!("server {name}"),
                    BackendError::server(format!("{e}\n{logs}")),
                ))
            }
        }
    }
}

/// A server container started by [`DockerLauncher`].
#[derive(Debug)]
pub struct DockerServer {
    name: String,
    binary: String,
    client: ServerClient,
    running: bool,
}

impl DockerServer {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl InferenceServer for DockerServer {
    fn endpoint(&self) -> &str {
        self.client.base_url()
    }

    async fn generate(
        &self,
        prompts: &[String],
        parameters: &GenerateParameters,
    ) -> Result<Vec<String>> {
        self.client.generate(prompts, parameters).await
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.client.embed(texts).await
    }

    async fn close(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        info!(name = %self.name, "Stopping inference server");
        run(&self.binary, &["stop".to_string(), self.name.clone()]).await?;
        self.running = false;
        Ok(())
    }
}

impl Drop for DockerServer {
    fn drop(&mut self) {
        if !self.running {
            return;
        }
        warn!(name = %self.name, "Inference server dropped while running, stopping it");
        let stop = std::process::Command::new(&self.binary)
            .args(["stop", self.name.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = stop {
            warn!(name = %self.name, error = %e, "Could not stop dropped server");
        }
    }
}
