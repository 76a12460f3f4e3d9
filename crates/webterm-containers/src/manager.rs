use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use which::which;

use crate::errors::{ContainerError, ContainerResult};
use crate::image;
use crate::models::{ContainerRecord, ContainerStats, ContainersConfig, ACTIVE_WINDOW};
use crate::ports;
use crate::process::{CommandRunner, StreamedLine, SystemRunner};

/// Contract between the broker and whatever owns the containers. In-process
/// this is [`DockerManager`]; with `CONTAINER_SERVICE_URL` set it is
/// [`RemoteContainers`] talking to another broker's admin API.
#[async_trait]
pub trait ContainerService: Send + Sync + 'static {
    /// Build the SSH image if this process hasn't yet. Idempotent;
    /// concurrent callers are serialized so the build runs at most once.
    async fn ensure_image(&self) -> ContainerResult<()>;

    /// Start a container publishing its sshd onto a fresh host port and
    /// wait until the listener accepts.
    async fn create(&self) -> ContainerResult<ContainerRecord>;

    /// Stop and remove. Unknown ids are treated as already gone.
    async fn stop(&self, container_id: &str) -> ContainerResult<()>;

    /// Advance last-activity. Unknown ids are a no-op.
    async fn touch(&self, container_id: &str);

    async fn list(&self) -> ContainerResult<Vec<ContainerRecord>>;

    async fn stats(&self) -> ContainerResult<Vec<ContainerStats>>;

    /// Stop every container idle longer than `max_idle`; returns how many
    /// were reaped.
    async fn reap_idle(&self, max_idle: Duration) -> ContainerResult<usize>;
}

struct ContainerEntry {
    record: ContainerRecord,
    last_activity: Instant,
}

pub struct DockerManager {
    runner: Arc<dyn CommandRunner>,
    docker_path: String,
    config: ContainersConfig,
    containers: Mutex<HashMap<String, ContainerEntry>>,
    /// Build-once flag. Held across the build on purpose: concurrent
    /// callers block until the first build settles, and a failed build
    /// leaves the flag unset so the next caller retries.
    image_built: Mutex<bool>,
}

impl DockerManager {
    pub fn new(config: ContainersConfig) -> ContainerResult<Self> {
        let docker_path = which("docker")
            .map_err(|_| ContainerError::MissingBinary("docker".to_string()))?
            .to_string_lossy()
            .to_string();
        Ok(Self::with_runner(Arc::new(SystemRunner), docker_path, config))
    }

    /// Construction seam for tests: any runner, any "docker" path.
    pub fn with_runner(
        runner: Arc<dyn CommandRunner>,
        docker_path: String,
        config: ContainersConfig,
    ) -> Self {
        Self {
            runner,
            docker_path,
            config,
            containers: Mutex::new(HashMap::new()),
            image_built: Mutex::new(false),
        }
    }

    async fn run_docker(&self, args: &[&str]) -> ContainerResult<crate::process::CommandOutput> {
        self.runner.run(&self.docker_path, args).await
    }

    /// `docker stop` then `docker rm`; the runtime reporting the container
    /// as unknown is treated as already gone.
    async fn remove_container(&self, container_id: &str) -> ContainerResult<()> {
        for subcommand in ["stop", "rm"] {
            match self.run_docker(&[subcommand, container_id]).await {
                Ok(_) => {}
                Err(ContainerError::CommandFailed { message, .. })
                    if is_already_gone(&message) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

fn is_already_gone(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("is not running")
}

#[async_trait]
impl ContainerService for DockerManager {
    async fn ensure_image(&self) -> ContainerResult<()> {
        let mut built = self.image_built.lock().await;
        if *built {
            return Ok(());
        }

        let context = image::write_build_context(
            &self.config.build_dir(),
            &self.config.root_password,
        )
        .await?;
        let context = context.to_string_lossy().to_string();

        info!(tag = %self.config.image_tag, "building ssh image");

        // Stream the build output into the log; keep a stderr tail for the
        // error report if the build fails.
        let (lines_tx, mut lines_rx) = mpsc::unbounded_channel();
        let log_task = tokio::spawn(async move {
            let mut stderr_tail: Vec<String> = Vec::new();
            while let Some(line) = lines_rx.recv().await {
                match line {
                    StreamedLine::Stdout(line) => debug!("docker build: {line}"),
                    StreamedLine::Stderr(line) => {
                        debug!("docker build: {line}");
                        stderr_tail.push(line);
                        if stderr_tail.len() > 20 {
                            stderr_tail.remove(0);
                        }
                    }
                }
            }
            stderr_tail.join("\n")
        });

        let exit_code = self
            .runner
            .run_streamed(
                &self.docker_path,
                &["build", "-t", &self.config.image_tag, &context],
                lines_tx,
            )
            .await
            .map_err(|err| ContainerError::ImageBuild(err.to_string()))?;
        let stderr_tail = log_task.await.unwrap_or_default();

        if exit_code != 0 {
            return Err(ContainerError::ImageBuild(stderr_tail));
        }

        *built = true;
        Ok(())
    }

    async fn create(&self) -> ContainerResult<ContainerRecord> {
        self.ensure_image().await?;

        let port = ports::allocate(self.config.base_port).await?;
        let publish = format!("{port}:22");
        let output = self
            .run_docker(&["run", "-d", "-p", &publish, &self.config.image_tag])
            .await
            .map_err(|err| ContainerError::Create(err.to_string()))?;

        let container_id: String = output.stdout.trim().chars().take(12).collect();
        if container_id.is_empty() {
            return Err(ContainerError::Create(
                "runtime returned no container id".to_string(),
            ));
        }

        if let Err(err) = ports::await_listener(
            &self.config.host,
            port,
            self.config.ready_timeout,
            self.config.ready_interval,
        )
        .await
        {
            // Started but never became reachable; don't leak the orphan.
            warn!(%container_id, port, "container never became ready, stopping it");
            if let Err(stop_err) = self.remove_container(&container_id).await {
                warn!(%container_id, %stop_err, "rollback stop failed");
            }
            return Err(ContainerError::Create(err.to_string()));
        }

        let record = ContainerRecord {
            container_id: container_id.clone(),
            host: self.config.host.clone(),
            port,
            username: self.config.username.clone(),
            password: self.config.root_password.clone(),
            created_at: Utc::now(),
        };

        let mut containers = self.containers.lock().await;
        containers.insert(
            container_id.clone(),
            ContainerEntry {
                record: record.clone(),
                last_activity: Instant::now(),
            },
        );
        info!(%container_id, port, "created container");
        Ok(record)
    }

    async fn stop(&self, container_id: &str) -> ContainerResult<()> {
        // Erase the record first; the runtime teardown below tolerates the
        // container already being gone.
        {
            let mut containers = self.containers.lock().await;
            containers.remove(container_id);
        }

        self.remove_container(container_id).await?;
        info!(%container_id, "stopped container");
        Ok(())
    }

    async fn touch(&self, container_id: &str) {
        let mut containers = self.containers.lock().await;
        if let Some(entry) = containers.get_mut(container_id) {
            entry.last_activity = Instant::now();
        }
    }

    async fn list(&self) -> ContainerResult<Vec<ContainerRecord>> {
        let containers = self.containers.lock().await;
        let mut records: Vec<ContainerRecord> =
            containers.values().map(|e| e.record.clone()).collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn stats(&self) -> ContainerResult<Vec<ContainerStats>> {
        let now = Utc::now();
        let containers = self.containers.lock().await;
        let mut stats: Vec<ContainerStats> = containers
            .values()
            .map(|entry| {
                let idle = entry.last_activity.elapsed();
                ContainerStats {
                    container_id: entry.record.container_id.clone(),
                    port: entry.record.port,
                    host: entry.record.host.clone(),
                    created_at: entry.record.created_at,
                    duration: (now - entry.record.created_at).num_seconds().max(0) as u64,
                    idle_time: idle.as_secs(),
                    is_active: idle < ACTIVE_WINDOW,
                }
            })
            .collect();
        stats.sort_by_key(|s| s.created_at);
        Ok(stats)
    }

    async fn reap_idle(&self, max_idle: Duration) -> ContainerResult<usize> {
        // Snapshot the idle ids without holding the lock across the
        // subprocess calls below.
        let idle_ids: Vec<String> = {
            let containers = self.containers.lock().await;
            containers
                .iter()
                .filter(|(_, entry)| entry.last_activity.elapsed() > max_idle)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut reaped = 0;
        for container_id in idle_ids {
            match self.stop(&container_id).await {
                Ok(()) => reaped += 1,
                Err(err) => warn!(%container_id, %err, "failed to reap idle container"),
            }
        }
        if reaped > 0 {
            info!(reaped, "reaped idle containers");
        }
        Ok(reaped)
    }
}

/// Out-of-process backend: the same contract over the admin HTTP surface of
/// another broker process. Image builds and idle reaping stay with the
/// owning process; `touch` is local-only there too, so both are no-ops here.
pub struct RemoteContainers {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct RemoteCreateResponse {
    success: bool,
    container: Option<ContainerRecord>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct RemoteListResponse {
    containers: Vec<ContainerRecord>,
}

#[derive(Deserialize)]
struct RemoteStatsResponse {
    containers: Vec<ContainerStats>,
}

impl RemoteContainers {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl ContainerService for RemoteContainers {
    async fn ensure_image(&self) -> ContainerResult<()> {
        Ok(())
    }

    async fn create(&self) -> ContainerResult<ContainerRecord> {
        let response: RemoteCreateResponse = self
            .client
            .post(self.url("/api/containers/create"))
            .send()
            .await
            .map_err(|err| ContainerError::Remote(err.to_string()))?
            .json()
            .await
            .map_err(|err| ContainerError::Remote(err.to_string()))?;

        if !response.success {
            return Err(ContainerError::Create(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        response
            .container
            .ok_or_else(|| ContainerError::Remote("create reply missing container".to_string()))
    }

    async fn stop(&self, container_id: &str) -> ContainerResult<()> {
        self.client
            .delete(self.url(&format!("/api/containers/{container_id}")))
            .send()
            .await
            .map_err(|err| ContainerError::Remote(err.to_string()))?;
        Ok(())
    }

    async fn touch(&self, _container_id: &str) {}

    async fn list(&self) -> ContainerResult<Vec<ContainerRecord>> {
        let response: RemoteListResponse = self
            .client
            .get(self.url("/api/containers/list"))
            .send()
            .await
            .map_err(|err| ContainerError::Remote(err.to_string()))?
            .json()
            .await
            .map_err(|err| ContainerError::Remote(err.to_string()))?;
        Ok(response.containers)
    }

    async fn stats(&self) -> ContainerResult<Vec<ContainerStats>> {
        let response: RemoteStatsResponse = self
            .client
            .get(self.url("/api/containers/stats"))
            .send()
            .await
            .map_err(|err| ContainerError::Remote(err.to_string()))?
            .json()
            .await
            .map_err(|err| ContainerError::Remote(err.to_string()))?;
        Ok(response.containers)
    }

    async fn reap_idle(&self, _max_idle: Duration) -> ContainerResult<usize> {
        Ok(0)
    }
}
