/// Domain errors for the lodestone registry core
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The heartbeat queue stayed full past the enqueue deadline.
    #[error("heartbeat task waiting for processing timeout")]
    HeartbeatTimeout,

    #[error("service {0} not found")]
    ServiceNotFound(String),

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("duplicate instance {0}")]
    DuplicateInstance(String),

    #[error("service can only contain one rule type, black or white")]
    MixedRuleType,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("eviction transaction timed out")]
    EvictionTimeout,

    #[error("registry is shutting down")]
    ShuttingDown,
}

impl RegistryError {
    /// "No data" rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::ServiceNotFound(_) | RegistryError::InstanceNotFound(_)
        )
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, RegistryError::PermissionDenied(_))
    }

    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            RegistryError::Internal(_) | RegistryError::Persistence(_) | RegistryError::EvictionTimeout
        )
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
