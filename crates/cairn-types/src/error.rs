use thiserror::Error;

pub type Result<T> = std::result::Result<T, CairnError>;

#[derive(Debug, Error)]
pub enum CairnError {
    /// Malformed walk entry or unreadable input mid-stream.
    #[error("input error: {0}")]
    Input(String),

    #[error("storage error: {0}")]
    StorageFatal(String),

    /// On-disk structure failed validation (digest mismatch, stale
    /// cross-reference). Carries the storage name of the offending file.
    #[error("corruption in '{name}': {detail}")]
    Corruption { name: String, detail: String },

    /// Ciphertext failed authentication.
    #[error("authentication failure: {0}")]
    AuthFailure(String),

    /// Lost the compare-and-set race on a ref.
    #[error("ref update conflict on '{0}'")]
    RefConflict(String),

    #[error("repository not found at '{0}'")]
    RepoNotFound(String),

    #[error("repository already exists at '{0}'")]
    RepoAlreadyExists(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unknown object type tag: {0}")]
    UnknownObjectType(u8),

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("unsupported storage driver: '{0}'")]
    UnsupportedDriver(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
