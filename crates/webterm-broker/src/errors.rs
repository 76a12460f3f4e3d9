use thiserror::Error;

/// Session failure taxonomy. `Display` is the exact client-facing message
/// carried by `terminal:error`.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BrokerError {
    #[error("{0}")]
    Validation(String),
    #[error("Too many connection attempts. Please wait before trying again.")]
    RateLimited,
    #[error("Connection already in progress or established")]
    Busy,
    #[error("Connection refused - check host and port")]
    NetworkRefused,
    #[error("Host unreachable")]
    HostUnreachable,
    #[error("Host not found")]
    HostNotFound,
    #[error("Connection timeout")]
    Timeout,
    #[error("Authentication failed - check username and password")]
    Auth,
    #[error("Protocol error - incompatible SSH server")]
    Protocol,
    #[error("Shell error: {0}")]
    Shell(String),
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("Failed to create container: {0}")]
    ContainerCreate(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_are_stable() {
        assert_eq!(
            BrokerError::RateLimited.to_string(),
            "Too many connection attempts. Please wait before trying again."
        );
        assert_eq!(
            BrokerError::Busy.to_string(),
            "Connection already in progress or established"
        );
        assert_eq!(
            BrokerError::NetworkRefused.to_string(),
            "Connection refused - check host and port"
        );
        assert_eq!(BrokerError::HostUnreachable.to_string(), "Host unreachable");
        assert_eq!(BrokerError::HostNotFound.to_string(), "Host not found");
        assert_eq!(BrokerError::Timeout.to_string(), "Connection timeout");
        assert_eq!(
            BrokerError::Auth.to_string(),
            "Authentication failed - check username and password"
        );
        assert_eq!(
            BrokerError::Protocol.to_string(),
            "Protocol error - incompatible SSH server"
        );
        assert_eq!(
            BrokerError::Shell("channel refused".into()).to_string(),
            "Shell error: channel refused"
        );
        assert_eq!(
            BrokerError::Validation("Host is required".into()).to_string(),
            "Host is required"
        );
    }
}
