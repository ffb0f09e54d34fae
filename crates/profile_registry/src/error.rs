use core_types::ProfileId;
use secrets::SecretError;
use storage_sqlite::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("profile {0} not found")]
    NotFound(ProfileId),

    #[error("the last remaining profile cannot be deleted")]
    LastProfile,

    #[error("the selected profile cannot be deleted")]
    SelectedProfile,

    #[error("the default profile cannot be deleted")]
    DefaultProfile,

    #[error("malformed profile export: {0}")]
    MalformedExport(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Secret(#[from] SecretError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
