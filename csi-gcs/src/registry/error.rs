use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("kubectl failed: {0}")]
    CommandFailed(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("failed to parse cluster response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

impl From<RegistryError> for Status {
    fn from(err: RegistryError) -> Self {
        match &err {
            RegistryError::NotFound(_) => Status::not_found(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}
