use thiserror::Error;

#[derive(Error, Debug)]
pub enum PagelensError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDeserialize(#[from] toml::de::Error),

    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    #[error("No extension connected")]
    NoAgent,

    #[error("Command timeout")]
    Timeout,

    #[error("Unknown element: {0}")]
    UnknownElement(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Tab not found: {0}")]
    TabNotFound(u64),
}

pub type Result<T> = std::result::Result<T, PagelensError>;
