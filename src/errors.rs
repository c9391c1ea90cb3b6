use thiserror::Error;

pub type Result<T, E = PerchError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PerchError {
    #[error("config error: {0}")]
    Config(String),
    #[error("wayland error: {0}")]
    Wayland(String),
    #[error("event loop error: {0}")]
    EventLoop(String),
    #[error("ipc error: {0}")]
    Ipc(String),
}

/// Outcome of a `reload` or `switch` request, as reported to the caller.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("Profile not found")]
    ProfileNotFound,
    #[error("Profile does not match the current output configuration")]
    ProfileNotMatched,
    #[error("Profile could not be applied by the compositor")]
    ProfileNotApplied,
    #[error("Configuration file could not be loaded")]
    InvalidConfig,
    #[error("Invalid request")]
    InvalidRequest,
}

impl ControlError {
    /// Name used on the control socket.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ControlError::ProfileNotFound => "ProfileNotFound",
            ControlError::ProfileNotMatched => "ProfileNotMatched",
            ControlError::ProfileNotApplied => "ProfileNotApplied",
            ControlError::InvalidConfig => "InvalidConfig",
            ControlError::InvalidRequest => "InvalidRequest",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "ProfileNotFound" => Some(ControlError::ProfileNotFound),
            "ProfileNotMatched" => Some(ControlError::ProfileNotMatched),
            "ProfileNotApplied" => Some(ControlError::ProfileNotApplied),
            "InvalidConfig" => Some(ControlError::InvalidConfig),
            "InvalidRequest" => Some(ControlError::InvalidRequest),
            _ => None,
        }
    }
}
