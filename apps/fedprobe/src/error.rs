use thiserror::Error;

/// Rejected before any network activity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("server name is empty")]
    EmptyServerName,
    #[error("server name `{0}` must not carry a URI scheme")]
    SchemePrefix(String),
    #[error("server name `{name}` is malformed: {reason}")]
    MalformedServerName { name: String, reason: String },
    #[error("missing required identifier: {0}")]
    MissingIdentifier(&'static str),
    #[error("`{0}` is not a server name, user id, room id or room alias")]
    UnrecognisedTarget(String),
    #[error("{count} servers exceed the supported maximum of {max}; pick a specific server")]
    TooManyTargets { count: usize, max: usize },
    #[error("invalid {field}: {reason}")]
    InvalidParameter { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum FedProbeError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("homeserver request failed: {0}")]
    Homeserver(String),
    #[error("federation request to {server} failed: {message}")]
    Federation { server: String, message: String },
    #[error("room membership lookup failed: {0}")]
    Membership(String),
    #[error("no backwalk session with id {0}")]
    UnknownSession(u64),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("background task failed: {0}")]
    Task(String),
}

pub type FedProbeResult<T> = Result<T, FedProbeError>;
