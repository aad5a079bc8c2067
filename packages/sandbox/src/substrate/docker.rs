// ABOUTME: Docker substrate that runs each sandbox as a labelled container
// ABOUTME: Uses bollard to observe, create and force-remove managed containers

use super::{
    Result, Substrate, SubstrateError, SubstrateSnapshot, Workload, WorkloadPhase, WorkloadSpec,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
        StartContainerOptions,
    },
    image::CreateImageOptions,
    models::ContainerInspectResponse,
    Docker,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const LABEL_PREFIX: &str = "liteboxd";
const NAME_PREFIX: &str = "liteboxd-";

pub struct DockerSubstrate {
    client: Docker,
    pull_timeout: Duration,
}

impl DockerSubstrate {
    /// Connect to the local daemon with a 10 minute image pull timeout
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| SubstrateError::ConnectionError(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            pull_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    pub fn client(&self) -> &Docker {
        &self.client
    }

    pub async fn is_available(&self) -> bool {
        match self.client.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Docker not available: {}", e);
                false
            }
        }
    }

    fn container_name(id: &str) -> String {
        format!("{}{}", NAME_PREFIX, id)
    }

    fn to_container_config(&self, spec: &WorkloadSpec) -> Config<String> {
        let labels = HashMap::from([
            (format!("{}.managed", LABEL_PREFIX), "true".to_string()),
            (format!("{}.sandbox.id", LABEL_PREFIX), spec.id.clone()),
        ]);

        let mut env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();

        let host_config = bollard::models::HostConfig {
            nano_cpus: parse_cpu_nanos(&spec.cpu),
            memory: parse_memory_bytes(&spec.memory),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: spec
                .startup_script
                .as_ref()
                .map(|script| vec!["sh".to_string(), "-c".to_string(), script.clone()]),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// Map a container state to a workload phase
    fn convert_state(state: &str, exit_code: Option<i64>) -> WorkloadPhase {
        match state.to_lowercase().as_str() {
            "created" => WorkloadPhase::Pending,
            "running" | "restarting" => WorkloadPhase::Running,
            "removing" => WorkloadPhase::Terminating,
            "exited" if exit_code == Some(0) => WorkloadPhase::Succeeded,
            "exited" | "dead" => WorkloadPhase::Failed,
            _ => WorkloadPhase::Unknown,
        }
    }

    fn to_workload(id: String, inspect: &ContainerInspectResponse) -> Workload {
        let state = inspect.state.as_ref();
        let status = state
            .and_then(|s| s.status.as_ref())
            .map(|s| s.as_ref().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let phase = Self::convert_state(&status, state.and_then(|s| s.exit_code));

        let transition = match phase {
            WorkloadPhase::Running => state.and_then(|s| s.started_at.clone()),
            WorkloadPhase::Succeeded | WorkloadPhase::Failed => {
                state.and_then(|s| s.finished_at.clone())
            }
            _ => None,
        }
        .or_else(|| inspect.created.clone());

        let last_transition_at = transition
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let ip = inspect.network_settings.as_ref().and_then(|ns| {
            ns.ip_address
                .clone()
                .filter(|s| !s.is_empty())
                .or_else(|| {
                    ns.networks.as_ref().and_then(|networks| {
                        networks
                            .values()
                            .filter_map(|n| n.ip_address.clone())
                            .find(|s| !s.is_empty())
                    })
                })
        });

        Workload {
            id,
            phase,
            ip,
            last_transition_at,
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(SubstrateError::ImageError(e.to_string())),
        }
    }

    /// Pull `image`, bounded by the pull timeout
    pub async fn pull_image(&self, image: &str) -> Result<()> {
        pull_image(&self.client, image, self.pull_timeout).await
    }
}

/// Pull `image` through `client`, giving up after `timeout`
pub async fn pull_image(client: &Docker, image: &str, timeout: Duration) -> Result<()> {
    info!("Pulling image: {} (timeout: {:?})", image, timeout);

    let options = CreateImageOptions {
        from_image: image.to_string(),
        ..Default::default()
    };
    let mut stream = client.create_image(Some(options), None, None);

    let pulled = tokio::time::timeout(timeout, async {
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(|e| {
                SubstrateError::ImageError(format!("Failed to pull image {}: {}", image, e))
            })?;
            if let Some(error) = info.error {
                return Err(SubstrateError::ImageError(format!(
                    "Failed to pull image {}: {}",
                    image, error
                )));
            }
            if let Some(status) = info.status {
                debug!("Pull status: {}", status);
            }
        }
        Ok(())
    })
    .await;

    match pulled {
        Ok(result) => result,
        Err(_) => Err(SubstrateError::ImageError(format!(
            "Timeout pulling image {} after {:?}",
            image, timeout
        ))),
    }
}

#[async_trait]
impl Substrate for DockerSubstrate {
    fn name(&self) -> &str {
        "docker"
    }

    async fn snapshot(&self) -> Result<SubstrateSnapshot> {
        let taken_at = Utc::now();
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}.managed=true", LABEL_PREFIX)],
        )]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        // a failed listing means no observation at all
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| SubstrateError::ConnectionError(e.to_string()))?;

        let mut workloads = Vec::with_capacity(containers.len());
        let mut warnings = Vec::new();

        for container in containers {
            let Some(container_id) = container.id else {
                continue;
            };
            let sandbox_id = container
                .labels
                .as_ref()
                .and_then(|labels| labels.get(&format!("{}.sandbox.id", LABEL_PREFIX)).cloned())
                .or_else(|| {
                    container.names.as_ref().and_then(|names| {
                        names.iter().find_map(|n| {
                            n.trim_start_matches('/')
                                .strip_prefix(NAME_PREFIX)
                                .map(str::to_string)
                        })
                    })
                });
            let Some(sandbox_id) = sandbox_id else {
                warnings.push(format!("container {} has no sandbox id label", container_id));
                continue;
            };

            match self.client.inspect_container(&container_id, None).await {
                Ok(inspect) => workloads.push(Self::to_workload(sandbox_id, &inspect)),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {
                    // removed between list and inspect
                    debug!("Container {} vanished during snapshot", container_id);
                }
                Err(e) => {
                    warn!("Failed to inspect container {}: {}", container_id, e);
                    warnings.push(format!("sandbox {}: {}", sandbox_id, e));
                }
            }
        }

        Ok(SubstrateSnapshot {
            incomplete: !warnings.is_empty(),
            workloads,
            warnings,
            taken_at,
        })
    }

    async fn create(&self, spec: &WorkloadSpec) -> Result<()> {
        info!("Creating container for sandbox {}", spec.id);

        if !self.image_exists(&spec.image).await? {
            self.pull_image(&spec.image).await?;
        }

        let options = CreateContainerOptions {
            name: Self::container_name(&spec.id),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), self.to_container_config(spec))
            .await
            .map_err(|e| SubstrateError::WorkloadError(e.to_string()))?;

        self.client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SubstrateError::WorkloadError(e.to_string()))?;

        debug!("Started container {} for sandbox {}", container.id, spec.id);
        Ok(())
    }

    async fn terminate(&self, id: &str) -> Result<()> {
        info!("Removing container for sandbox {}", id);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(&Self::container_name(id), Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(SubstrateError::WorkloadError(e.to_string())),
        }
    }
}

/// `500m`, `1`, `1.5` -> nano CPUs. Anything else leaves the limit unset.
pub fn parse_cpu_nanos(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let cores = match raw.strip_suffix('m') {
        Some(milli) => milli.parse::<f64>().ok()? / 1000.0,
        None => raw.parse::<f64>().ok()?,
    };
    if cores <= 0.0 || !cores.is_finite() {
        return None;
    }
    Some((cores * 1_000_000_000.0) as i64)
}

/// `512Mi`, `1Gi`, `256M`, `1048576` -> bytes. Anything else leaves the limit unset.
pub fn parse_memory_bytes(raw: &str) -> Option<i64> {
    const UNITS: [(&str, i64); 8] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];

    let raw = raw.trim();
    for (suffix, factor) in UNITS {
        if let Some(number) = raw.strip_suffix(suffix) {
            let value = number.parse::<i64>().ok()?;
            return (value > 0).then(|| value.checked_mul(factor)).flatten();
        }
    }
    raw.parse::<i64>().ok().filter(|v| *v > 0)
}
