// courier-messaging-core/src/error.rs
use thiserror::Error;

/// System error code for a DNS lookup that found no host.
pub const ENOTFOUND: &str = "ENOTFOUND";
/// System error code for a refused TCP connection.
pub const ECONNREFUSED: &str = "ECONNREFUSED";

#[derive(Debug, Clone, Error)]
pub enum MessagingError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection manager is closed")]
    Closed,

    #[error("channel error: {0}")]
    Channel(String),

    #[error("declare error: {0}")]
    Declare(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("no reply within {0}ms")]
    Timeout(u64),
}

impl From<serde_json::Error> for MessagingError {
    fn from(e: serde_json::Error) -> Self {
        MessagingError::Serialization(e.to_string())
    }
}

/// Transport failure as reported by the broker client, before classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTransportError {
    pub code: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub hostname: Option<String>,
    pub message: String,
}

impl RawTransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_endpoint(mut self, hostname: impl Into<String>, port: u16) -> Self {
        let hostname = hostname.into();
        self.address = Some(hostname.clone());
        self.hostname = Some(hostname);
        self.port = Some(port);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    HostNotFound,
    ConnectionRefused,
    Other,
}

/// Normalized transport error.
///
/// Carries the same fields as the raw error; only `message` is rewritten for
/// the two conditions operators hit most often (unknown host, refused port).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub code: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub hostname: Option<String>,
    pub message: String,
}

impl TransportError {
    pub fn classify(raw: RawTransportError) -> Self {
        let kind = match raw.code.as_deref() {
            Some(ENOTFOUND) => TransportErrorKind::HostNotFound,
            Some(ECONNREFUSED) => TransportErrorKind::ConnectionRefused,
            _ => TransportErrorKind::Other,
        };

        let message = match kind {
            TransportErrorKind::HostNotFound => {
                format!("Host {} not found", display_or_empty(&raw.hostname))
            }
            TransportErrorKind::ConnectionRefused => format!(
                "{}:{} connection refused",
                display_or_empty(&raw.address),
                raw.port.map(|p| p.to_string()).unwrap_or_default()
            ),
            TransportErrorKind::Other => raw.message,
        };

        Self {
            kind,
            code: raw.code,
            address: raw.address,
            port: raw.port,
            hostname: raw.hostname,
            message,
        }
    }
}

impl From<RawTransportError> for TransportError {
    fn from(raw: RawTransportError) -> Self {
        TransportError::classify(raw)
    }
}

fn display_or_empty(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or_default()
}
