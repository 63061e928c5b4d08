/// Result alias that carries the custom [`HaptickleError`] type.
pub type Result<T> = std::result::Result<T, HaptickleError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum HaptickleError {
    /// Free-form failure, mostly used for poisoned internal state.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors (socket binding, config files).
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration file could not be parsed.
    #[error("invalid configuration json: {0}")]
    Json(#[from] serde_json::Error),
    /// Configuration parsed but failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// An external trigger referenced a device mapping that does not exist.
    #[error("unknown device mapping `{0}`")]
    UnknownDeviceMapping(String),
    /// No configured trigger carries the requested id.
    #[error("unknown trigger `{0}`")]
    UnknownTrigger(String),
    /// An OSC datagram is well formed but not something the engine accepts.
    #[error("malformed osc datagram: {0}")]
    Osc(&'static str),
    /// The OSC codec rejected a packet.
    #[error("osc codec error: {0}")]
    OscCodec(String),
    /// The local haptic device rejected a command.
    #[error("haptic device error: {0}")]
    Device(String),
}

impl HaptickleError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for HaptickleError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for HaptickleError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
