pub mod api;
pub mod broker;
pub mod channel;
pub mod config;
pub mod errors;
pub mod models;
pub mod ssh;
pub mod supervisor;

pub use api::{build_router, AppState};
pub use broker::{Broker, SessionCommand, SessionStatus};
pub use config::{BrokerConfig, HostVerification};
pub use errors::BrokerError;
pub use supervisor::Supervisor;

pub const DEFAULT_HTTP_PORT: u16 = 3001;
