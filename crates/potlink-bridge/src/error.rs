use std::borrow::Cow;
use std::fmt;

/// All bridge error kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connecting to the broker, publishing or subscribing failed.
    Transport,
    /// No reply arrived before the call deadline.
    Timeout,
    /// A device replied with a status different from `ok`, or with a reply
    /// which cannot be decoded.
    Application,
    /// An inbound payload cannot be decoded or misses required fields.
    MalformedPayload,
    /// The device is not present in the device registry.
    UnknownDevice,
    /// The caller cancelled the call before a reply arrived.
    Cancelled,
    /// Correlation registry misuse.
    Registry,
    /// The durable store or the device registry failed.
    Store,
    /// Invalid configuration.
    Config,
}

impl ErrorKind {
    pub(crate) const fn description(self) -> &'static str {
        match self {
            Self::Transport => "Transport",
            Self::Timeout => "Timeout",
            Self::Application => "Application",
            Self::MalformedPayload => "Malformed Payload",
            Self::UnknownDevice => "Unknown Device",
            Self::Cancelled => "Cancelled",
            Self::Registry => "Correlation Registry",
            Self::Store => "Storage",
            Self::Config => "Configuration",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A bridge error.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    description: Cow<'static, str>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Creates an [`Error`] from an [`ErrorKind`] and a description.
    pub fn new(kind: ErrorKind, description: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    /// Returns the [`ErrorKind`].
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl From<rumqttc::v5::ClientError> for Error {
    fn from(e: rumqttc::v5::ClientError) -> Self {
        Self::new(ErrorKind::Transport, format!("MQTT client error: {e}"))
    }
}

impl From<rumqttc::v5::ConnectionError> for Error {
    fn from(e: rumqttc::v5::ConnectionError) -> Self {
        Self::new(ErrorKind::Transport, format!("MQTT connection error: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::MalformedPayload, format!("Json error caused by {e}"))
    }
}

/// A specialized [`Result`] type for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
