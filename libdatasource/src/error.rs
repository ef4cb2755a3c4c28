use tonic::Code;

pub type Result<T> = std::result::Result<T, DatasourceError>;

#[derive(Debug, thiserror::Error)]
pub enum DatasourceError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("conditional write lost a race, try again")]
    Conflict,
    #[error("address pool exhausted")]
    PoolExhausted,
    #[error("this instance is not the leader")]
    NotLeader,
    #[error("leadership is held by {0}")]
    LeadershipHeld(String),
    #[error("datasource has been shut down")]
    Closed,
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid key {0:?}")]
    InvalidKey(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DatasourceError {
    pub fn not_found(what: impl Into<String>) -> Self {
        DatasourceError::NotFound(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DatasourceError::NotFound(_))
    }

    /// Errors a caller may reasonably retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DatasourceError::Conflict | DatasourceError::Unavailable(_)
        )
    }
}

impl From<etcd_client::Error> for DatasourceError {
    fn from(e: etcd_client::Error) -> Self {
        match &e {
            etcd_client::Error::GRpcStatus(status)
                if matches!(status.code(), Code::NotFound) =>
            {
                DatasourceError::NotFound(status.message().to_string())
            }
            etcd_client::Error::GRpcStatus(status)
                if matches!(status.code(), Code::FailedPrecondition | Code::Aborted) =>
            {
                DatasourceError::Conflict
            }
            // Anything else on the wire is treated as a transient store failure.
            _ => DatasourceError::Unavailable(e.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for DatasourceError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DatasourceError::Unavailable("request timed out".to_string())
    }
}
