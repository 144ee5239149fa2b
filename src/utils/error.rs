use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnPoolError {
    #[error("Failed to connect to {endpoint}: {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Acquire cancelled")]
    Cancelled,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("{} connection(s) failed to close during dispose", failures.len())]
    DisposeFailed { failures: Vec<std::io::Error> },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnPoolError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ConnPoolError::InvalidOperation(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConnPoolError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, ConnPoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispose_failed_reports_count() {
        let err = ConnPoolError::DisposeFailed {
            failures: vec![
                std::io::Error::other("a"),
                std::io::Error::other("b"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "2 connection(s) failed to close during dispose"
        );
    }

    #[test]
    fn connect_failed_keeps_source() {
        let err = ConnPoolError::ConnectFailed {
            endpoint: "127.0.0.1:9".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().starts_with("Failed to connect to 127.0.0.1:9"));
    }
}
