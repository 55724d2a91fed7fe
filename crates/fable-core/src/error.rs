#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("No usable backends configured for '{kind}'")]
    ConfigurationExhausted { kind: String },

    #[error("Backend '{backend}' failed permanently: {reason}")]
    BackendPermanentFailure { backend: String, reason: String },

    #[error("All slots for backend '{backend}' are occupied")]
    GlobalSaturation { backend: String },

    #[error("Worker failed unexpectedly: {0}")]
    WorkerUnexpected(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_configuration_exhausted() {
        let err = AppError::ConfigurationExhausted {
            kind: "image".into(),
        };
        assert_eq!(err.to_string(), "No usable backends configured for 'image'");
    }

    #[test]
    fn test_display_backend_permanent_failure() {
        let err = AppError::BackendPermanentFailure {
            backend: "flux".into(),
            reason: "HTTP 500 after 3 attempts".into(),
        };
        assert_eq!(
            err.to_string(),
            "Backend 'flux' failed permanently: HTTP 500 after 3 attempts"
        );
    }

    #[test]
    fn test_display_global_saturation() {
        let err = AppError::GlobalSaturation {
            backend: "suno".into(),
        };
        assert_eq!(err.to_string(), "All slots for backend 'suno' are occupied");
    }

    #[test]
    fn test_display_worker_unexpected() {
        let err = AppError::WorkerUnexpected("connection reset".into());
        assert_eq!(
            err.to_string(),
            "Worker failed unexpectedly: connection reset"
        );
    }

    #[test]
    fn test_display_invalid_config() {
        let err = AppError::InvalidConfig("workers must be > 0".into());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: workers must be > 0"
        );
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AppError>();
    }
}
