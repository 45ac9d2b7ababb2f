//! Error types for the bus poller

/// Errors raised by link transports
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Failed to open link {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("Link I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port control failed: {0}")]
    Control(#[from] tokio_serial::Error),

    #[error("Link closed")]
    Closed,

    #[error("Payload too large for a datagram: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Not supported by this link: {0}")]
    Unsupported(&'static str),
}

pub type LinkResult<T> = Result<T, LinkError>;

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] Box<figment::Error>),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("max_devices ({max_devices}) exceeds the {limit} devices a topology roster can carry")]
    RosterTooLarge { max_devices: usize, limit: usize },

    #[error("Idle wait ({idle_ms}ms) exceeds max response wait ({max_ms}ms)")]
    IdleExceedsMax { idle_ms: u64, max_ms: u64 },
}
