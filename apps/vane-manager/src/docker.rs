//! Per-session sandbox lifecycle on the local Docker daemon.
//!
//! Sandbox names are chosen deterministically from the controller id and a
//! monotonic counter, so creation always clears a stale sandbox of the same
//! name first. Destruction tolerates sandboxes that already disappeared.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, LogsOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{EndpointSettings, HostConfig, PortBinding};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures_util::StreamExt;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::DockerConfig;
use crate::registry::ControllerDescriptor;

/// Grace period for container stop before force removal.
const STOP_GRACE_SECS: i64 = 10;

/// One isolated execution environment bound to a single session.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub id: String,
    pub name: String,
    pub image: String,
    pub created_at: OffsetDateTime,
    pub internal_ip: String,
    pub port: u16,
    pub session_id: String,
    pub controller: ControllerDescriptor,
}

pub struct SandboxDriver {
    docker: Docker,
    config: DockerConfig,
    network_id: String,
    sandboxes: Mutex<HashMap<String, SandboxHandle>>,
    counter: AtomicU64,
}

impl SandboxDriver {
    pub async fn new(config: DockerConfig) -> Result<SandboxDriver> {
        let docker = Docker::connect_with_local_defaults()
            .context("failed to connect to Docker daemon; is Docker running?")?;
        let network_id = ensure_network(&docker, &config.network_name).await?;
        Ok(SandboxDriver {
            docker,
            config,
            network_id,
            sandboxes: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        })
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    /// Creates and starts a sandbox for `controller`, publishing its internal
    /// port to the descriptor's external port. Returns a handle carrying the
    /// sandbox's network-internal address.
    pub async fn start(
        &self,
        controller: &ControllerDescriptor,
        session_id: &str,
    ) -> Result<SandboxHandle> {
        let number = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("{}{}-{}", self.config.container_prefix, controller.id, number);

        self.ensure_absent(&name).await?;

        let port_key = format!("{}/tcp", controller.ports.internal);
        let mut env = vec!["DEBUG_LEVEL=1".to_string()];
        let mut overrides: Vec<_> = self.config.environment.iter().collect();
        overrides.sort();
        for (key, value) in overrides {
            env.push(format!("{key}={value}"));
        }

        let host_config = HostConfig {
            memory: Some(parse_memory_limit(&self.config.memory_limit)),
            nano_cpus: Some((self.config.cpu_limit * 1e9) as i64),
            port_bindings: Some(HashMap::from([(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(controller.ports.external.to_string()),
                }]),
            )])),
            ..Default::default()
        };

        let container_config = ContainerConfig {
            image: Some(controller.image.clone()),
            hostname: Some(name.clone()),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            env: Some(env),
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig {
                endpoints_config: HashMap::from([(
                    self.config.network_name.clone(),
                    EndpointSettings {
                        network_id: Some(self.network_id.clone()),
                        ..Default::default()
                    },
                )]),
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .context("error creating sandbox container")?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .context("error starting sandbox container")?;

        let inspect = self
            .docker
            .inspect_container(&created.id, None)
            .await
            .context("error inspecting sandbox container")?;
        let internal_ip = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|mut networks| networks.remove(&self.config.network_name))
            .and_then(|endpoint| endpoint.ip_address)
            .unwrap_or_default();

        let handle = SandboxHandle {
            id: created.id,
            name: name.clone(),
            image: controller.image.clone(),
            created_at: OffsetDateTime::now_utc(),
            internal_ip,
            port: controller.ports.internal,
            session_id: session_id.to_string(),
            controller: controller.clone(),
        };

        self.sandboxes
            .lock()
            .await
            .insert(handle.id.clone(), handle.clone());
        info!(sandbox = %name, ip = %handle.internal_ip, session = %session_id, "sandbox started");
        Ok(handle)
    }

    /// Stops and removes a tracked sandbox. A sandbox that no longer exists
    /// in Docker is simply dropped from tracking.
    pub async fn stop(&self, sandbox_id: &str) -> Result<()> {
        let handle = self.sandboxes.lock().await.remove(sandbox_id);
        let Some(handle) = handle else {
            bail!("sandbox {sandbox_id:.12} not found in internal tracking");
        };

        if self.docker.inspect_container(sandbox_id, None).await.is_err() {
            debug!(sandbox = %handle.name, "sandbox already gone, dropping from tracking");
            return Ok(());
        }
        self.destroy(sandbox_id, &handle.name).await;
        Ok(())
    }

    pub async fn list(&self) -> Vec<SandboxHandle> {
        self.sandboxes.lock().await.values().cloned().collect()
    }

    /// Destroys every tracked sandbox; used by the shutdown sweep.
    pub async fn cleanup_all(&self) {
        let handles: Vec<SandboxHandle> =
            self.sandboxes.lock().await.drain().map(|(_, v)| v).collect();
        for handle in handles {
            if self.docker.inspect_container(&handle.id, None).await.is_err() {
                debug!(sandbox = %handle.name, "sandbox already gone, skipping cleanup");
                continue;
            }
            self.destroy(&handle.id, &handle.name).await;
        }
    }

    async fn destroy(&self, id: &str, name: &str) {
        if let Err(err) = self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            warn!(sandbox = %name, %err, "error stopping sandbox");
        }
        if let Err(err) = self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(sandbox = %name, %err, "error removing sandbox");
        }
        info!(sandbox = %name, "sandbox stopped and removed");
    }

    /// Stops and removes any stale container occupying `name` before a new
    /// sandbox reuses it.
    async fn ensure_absent(&self, name: &str) -> Result<()> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .context("error listing containers")?;

        for container in containers {
            let names = container.names.unwrap_or_default();
            // Docker reports names with a leading slash.
            if !names.iter().any(|n| n.trim_start_matches('/') == name) {
                continue;
            }
            let Some(id) = container.id else { continue };
            info!(sandbox = %name, "removing stale sandbox with the same name");
            if container.state.as_deref() == Some("running") {
                if let Err(err) = self
                    .docker
                    .stop_container(&id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
                    .await
                {
                    warn!(sandbox = %name, %err, "error stopping stale sandbox");
                }
            }
            self.docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await
                .with_context(|| format!("error removing stale sandbox {name}"))?;
            break;
        }
        Ok(())
    }

    /// Last log lines of a sandbox, for the readiness probe.
    pub async fn tail_logs(&self, sandbox_id: &str) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            tail: "20".to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(sandbox_id, Some(options));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&String::from_utf8_lossy(&log.into_bytes())),
                Err(err) => {
                    debug!(%err, "error reading sandbox logs");
                    break;
                }
            }
        }
        Ok(out)
    }

    pub async fn is_running(&self, sandbox_id: &str) -> bool {
        match self.docker.inspect_container(sandbox_id, None).await {
            Ok(info) => info.state.and_then(|s| s.running).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Runs a command inside the sandbox and returns its combined output.
    pub async fn exec(&self, sandbox_id: &str, cmd: Vec<String>) -> Result<String> {
        let exec = self
            .docker
            .create_exec(
                sandbox_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("error creating exec in sandbox")?;

        let mut out = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .context("error starting exec in sandbox")?
        {
            while let Some(Ok(log)) = output.next().await {
                out.push_str(&String::from_utf8_lossy(&log.into_bytes()));
            }
        }
        Ok(out)
    }
}

async fn ensure_network(docker: &Docker, name: &str) -> Result<String> {
    let networks = docker
        .list_networks(Some(ListNetworksOptions {
            filters: HashMap::from([("name".to_string(), vec![name.to_string()])]),
        }))
        .await
        .context("error listing networks")?;

    for network in networks {
        if network.name.as_deref() == Some(name) {
            let id = network.id.unwrap_or_default();
            debug!(network = %name, %id, "found existing network");
            return Ok(id);
        }
    }

    let response = docker
        .create_network(CreateNetworkOptions {
            name: name.to_string(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            attachable: true,
            ..Default::default()
        })
        .await
        .context("error creating network")?;
    let id = response.id.unwrap_or_default();
    info!(network = %name, %id, "created network");
    Ok(id)
}

/// Parses a memory limit like `512m` into bytes.
pub fn parse_memory_limit(limit: &str) -> i64 {
    let lower = limit.trim().to_ascii_lowercase();
    let (digits, multiplier) = if let Some(v) = lower.strip_suffix('k') {
        (v, 1024i64)
    } else if let Some(v) = lower.strip_suffix('m') {
        (v, 1024 * 1024)
    } else if let Some(v) = lower.strip_suffix('g') {
        (v, 1024 * 1024 * 1024)
    } else {
        (lower.as_str(), 1)
    };
    digits.trim().parse::<i64>().unwrap_or(0) * multiplier
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_limit_suffixes() {
        assert_eq!(parse_memory_limit("512m"), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("2G"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("64k"), 64 * 1024);
        assert_eq!(parse_memory_limit("1048576"), 1_048_576);
        assert_eq!(parse_memory_limit("garbage"), 0);
    }
}
