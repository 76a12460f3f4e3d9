use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use webterm_broker::{build_router, AppState, Broker, BrokerConfig, Supervisor, DEFAULT_HTTP_PORT};
use webterm_containers::{
    ContainerError, ContainerRecord, ContainerResult, ContainerService, ContainerStats,
    ContainersConfig, DockerManager, RemoteContainers,
};

#[derive(Parser, Debug)]
#[command(name = "webterm-brokerd", author, version)]
struct Options {
    /// Address the HTTP server binds to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,
    /// Port for the HTTP and WebSocket server
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "PORT")]
    port: u16,
    /// Directory used for logs
    #[arg(long, default_value = "/var/log/webterm", env = "WEBTERM_LOG_DIR")]
    log_dir: PathBuf,
    /// Base URL of an out-of-process container service; when unset the
    /// broker drives the local docker CLI itself
    #[arg(long, env = "CONTAINER_SERVICE_URL")]
    container_service_url: Option<String>,
    /// First host port tried when publishing container sshd ports
    #[arg(long, default_value_t = 2222)]
    container_base_port: u16,
    /// Seconds of silence before idle sessions and containers are reaped
    #[arg(long, default_value_t = 30 * 60)]
    idle_timeout_secs: u64,
    /// Seconds allowed for an SSH connection to become ready
    #[arg(long, default_value_t = 30)]
    connect_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let _guard = init_tracing(&options.log_dir);

    run_server(options).await;

    Ok(())
}

fn init_tracing(log_dir: &PathBuf) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    if let Err(err) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Failed to create log directory {:?}: {}. Logging to file disabled.",
            log_dir, err
        );
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "webterm-brokerd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(error) = result {
                    tracing::error!("failed to listen for shutdown signal: {error}");
                }
            }
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for shutdown signal: {error}");
        }
    }
    tracing::info!("shutdown signal received");
}

async fn run_server(options: Options) {
    let bind_ip = parse_bind_ip(&options.bind);

    let config = BrokerConfig {
        idle_timeout: Duration::from_secs(options.idle_timeout_secs),
        connect_timeout: Duration::from_secs(options.connect_timeout_secs),
        ..BrokerConfig::default()
    };

    let containers = build_containers(&options);
    let broker = Broker::new(containers.clone(), config.clone());
    let supervisor = Supervisor::spawn(broker.clone(), containers.clone(), config);

    let app = build_router(AppState::new(containers, broker));

    let addr = SocketAddr::new(bind_ip, options.port);
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(?error, %addr, "failed to bind listener");
            return;
        }
    };

    tracing::info!("webterm-brokerd listening on http://{}", addr);

    let shutdown = {
        let supervisor = supervisor.clone();
        async move {
            shutdown_signal().await;
            supervisor.shutdown().await;
        }
    };

    match axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        Ok(()) => tracing::info!("server shut down gracefully"),
        Err(error) => tracing::error!(?error, "server error"),
    }
}

fn parse_bind_ip(bind: &str) -> IpAddr {
    match bind.parse() {
        Ok(ip) => ip,
        Err(error) => {
            tracing::error!(?error, %bind, "invalid bind address; defaulting to 0.0.0.0");
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}

fn build_containers(options: &Options) -> Arc<dyn ContainerService> {
    if let Some(url) = &options.container_service_url {
        tracing::info!(%url, "using out-of-process container service");
        return Arc::new(RemoteContainers::new(url.clone()));
    }

    let config = ContainersConfig {
        base_port: options.container_base_port,
        ..ContainersConfig::default()
    };
    match DockerManager::new(config) {
        Ok(manager) => Arc::new(manager),
        Err(error) => {
            tracing::error!(
                %error,
                "failed to initialize container manager; running in degraded mode"
            );
            Arc::new(UnavailableContainers::new(error.to_string()))
        }
    }
}

/// Degraded-mode stand-in when the docker CLI is missing: direct SSH
/// sessions still work, container operations report the startup failure.
struct UnavailableContainers {
    reason: String,
}

impl UnavailableContainers {
    fn new(reason: String) -> Self {
        Self { reason }
    }

    fn error(&self, operation: &str) -> ContainerError {
        ContainerError::Create(format!(
            "{operation} unavailable: container service failed to start ({})",
            self.reason
        ))
    }
}

#[async_trait]
impl ContainerService for UnavailableContainers {
    async fn ensure_image(&self) -> ContainerResult<()> {
        Err(self.error("ensure image"))
    }

    async fn create(&self) -> ContainerResult<ContainerRecord> {
        Err(self.error("create container"))
    }

    async fn stop(&self, _container_id: &str) -> ContainerResult<()> {
        Err(self.error("stop container"))
    }

    async fn touch(&self, _container_id: &str) {}

    async fn list(&self) -> ContainerResult<Vec<ContainerRecord>> {
        Ok(Vec::new())
    }

    async fn stats(&self) -> ContainerResult<Vec<ContainerStats>> {
        Ok(Vec::new())
    }

    async fn reap_idle(&self, _max_idle: Duration) -> ContainerResult<usize> {
        Ok(0)
    }
}
