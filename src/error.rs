use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LoadTestError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Maximum concurrent jobs ({0}) reached")]
    CapacityExceeded(usize),
    #[error("Job not found: {0}")]
    JobNotFound(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Connection timeout after {0:?}")]
    ConnectTimeout(Duration),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("Worker failed: {0}")]
    WorkerFailed(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn config_error_display() {
        let err = LoadTestError::ConfigError("devices must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: devices must be at least 1"
        );
    }

    #[test]
    fn capacity_exceeded_display() {
        let err = LoadTestError::CapacityExceeded(5);
        assert_eq!(err.to_string(), "Maximum concurrent jobs (5) reached");
    }

    #[test]
    fn not_connected_display() {
        assert_eq!(LoadTestError::NotConnected.to_string(), "Not connected");
    }

    #[test]
    fn connect_timeout_is_distinct_from_connection_failed() {
        let timeout = LoadTestError::ConnectTimeout(Duration::from_secs(10));
        let refused = LoadTestError::ConnectionFailed("connection refused".to_string());
        assert!(matches!(timeout, LoadTestError::ConnectTimeout(_)));
        assert!(matches!(refused, LoadTestError::ConnectionFailed(_)));
        assert_ne!(timeout.to_string(), refused.to_string());
    }

    #[test]
    fn network_error_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let err: LoadTestError = io_err.into();
        assert!(matches!(err, LoadTestError::NetworkError(_)));
        assert_eq!(err.to_string(), "Network error: connection refused");
    }

    #[test]
    fn job_not_found_display() {
        let err = LoadTestError::JobNotFound("ab12cd34".to_string());
        assert_eq!(err.to_string(), "Job not found: ab12cd34");
    }
}
