use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("bucket '{0}' not found")]
    BucketNotFound(String),

    #[error("bucket '{0}' already exists")]
    BucketExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage command failed: {0}")]
    CommandFailed(String),

    #[error("failed to parse storage output: {0}")]
    ParseError(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => StoreError::Timeout(err.to_string()),
            _ => StoreError::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for Status {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::BucketNotFound(_) => Status::not_found(err.to_string()),
            StoreError::BucketExists(_) => Status::already_exists(err.to_string()),
            StoreError::PermissionDenied(_) => Status::permission_denied(err.to_string()),
            StoreError::InvalidRequest(_) => Status::invalid_argument(err.to_string()),
            StoreError::Timeout(_) => Status::deadline_exceeded(err.to_string()),
            StoreError::CommandFailed(_) | StoreError::ParseError(_) | StoreError::Io(_) => {
                Status::internal(err.to_string())
            }
        }
    }
}
