use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// External view of a running SSH container. Everything a client needs to
/// connect (including the fixed administrative credentials) plus creation
/// metadata. Idle tracking lives inside the manager, not on the wire.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    /// Runtime-assigned id, truncated to 12 characters.
    pub container_id: String,
    pub host: String,
    /// Host port published onto the container's port 22.
    pub port: u16,
    pub username: String,
    pub password: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub container_id: String,
    pub port: u16,
    pub host: String,
    pub created_at: DateTime<Utc>,
    /// Seconds since the container was created.
    pub duration: u64,
    /// Seconds since the last byte flowed through a session on this container.
    pub idle_time: u64,
    pub is_active: bool,
}

/// A container is reported active while bytes flowed through it recently.
pub const ACTIVE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct ContainersConfig {
    /// Tag given to the locally built SSH image.
    pub image_tag: String,
    /// Host address the published ports are reachable on.
    pub host: String,
    /// First port tried when allocating a host port for a container.
    pub base_port: u16,
    pub username: String,
    pub root_password: String,
    /// Total budget for the SSH listener to come up after `docker run`.
    pub ready_timeout: Duration,
    /// Delay between readiness probes.
    pub ready_interval: Duration,
    /// Where the image build context is written. Defaults to a directory
    /// under the system temp dir.
    pub build_dir: Option<PathBuf>,
}

impl Default for ContainersConfig {
    fn default() -> Self {
        Self {
            image_tag: "webterm-sshd".to_string(),
            host: "127.0.0.1".to_string(),
            base_port: 2222,
            username: "root".to_string(),
            root_password: "password123".to_string(),
            ready_timeout: Duration::from_secs(30),
            ready_interval: Duration::from_secs(1),
            build_dir: None,
        }
    }
}

impl ContainersConfig {
    pub fn build_dir(&self) -> PathBuf {
        self.build_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("webterm-image"))
    }
}
