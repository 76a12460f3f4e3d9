pub mod errors;
pub mod image;
pub mod manager;
pub mod models;
pub mod ports;
pub mod process;

pub use errors::{ContainerError, ContainerResult};
pub use manager::{ContainerService, DockerManager, RemoteContainers};
pub use models::{ContainerRecord, ContainerStats, ContainersConfig};
