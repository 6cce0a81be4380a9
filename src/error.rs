use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Conglomerate,
    Container,
    Sort,
    Factory,
    Savepoint,
    Controller,
    Scan,
    GlobalTransaction,
    Property,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Conglomerate => write!(f, "conglomerate"),
            ResourceType::Container => write!(f, "container"),
            ResourceType::Sort => write!(f, "sort"),
            ResourceType::Factory => write!(f, "factory"),
            ResourceType::Savepoint => write!(f, "savepoint"),
            ResourceType::Controller => write!(f, "controller"),
            ResourceType::Scan => write!(f, "scan"),
            ResourceType::GlobalTransaction => write!(f, "global transaction"),
            ResourceType::Property => write!(f, "property"),
        }
    }
}

/// Coarse classification callers use to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    Unsupported,
    Validation,
    Timeout,
    Protocol,
    StorageFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessErrorCode {
    Io,
    Encode,
    Decode,
    InvalidConfig,
    ConglomerateNotFound,
    ContainerNotFound,
    SortNotFound,
    FactoryNotFound,
    SavepointNotFound,
    ControllerNotFound,
    ScanNotFound,
    GlobalTransactionNotFound,
    PropertyNotFound,
    ContainerAlreadyExists,
    SavepointAlreadyExists,
    GlobalTransactionAlreadyExists,
    AlreadyExists,
    Unsupported,
    Validation,
    LockTimeout,
    ProtocolViolation,
    TransactionAborted,
    TransactionClosed,
    IllegalState,
    Corrupt,
    DuplicateKey,
    InvalidRow,
    ReadOnly,
    FactoryLoad,
}

impl AccessErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessErrorCode::Io => "io",
            AccessErrorCode::Encode => "encode",
            AccessErrorCode::Decode => "decode",
            AccessErrorCode::InvalidConfig => "invalid_config",
            AccessErrorCode::ConglomerateNotFound => "conglomerate_not_found",
            AccessErrorCode::ContainerNotFound => "container_not_found",
            AccessErrorCode::SortNotFound => "sort_not_found",
            AccessErrorCode::FactoryNotFound => "factory_not_found",
            AccessErrorCode::SavepointNotFound => "savepoint_not_found",
            AccessErrorCode::ControllerNotFound => "controller_not_found",
            AccessErrorCode::ScanNotFound => "scan_not_found",
            AccessErrorCode::GlobalTransactionNotFound => "global_transaction_not_found",
            AccessErrorCode::PropertyNotFound => "property_not_found",
            AccessErrorCode::ContainerAlreadyExists => "container_already_exists",
            AccessErrorCode::SavepointAlreadyExists => "savepoint_already_exists",
            AccessErrorCode::GlobalTransactionAlreadyExists => {
                "global_transaction_already_exists"
            }
            AccessErrorCode::AlreadyExists => "already_exists",
            AccessErrorCode::Unsupported => "unsupported",
            AccessErrorCode::Validation => "validation",
            AccessErrorCode::LockTimeout => "lock_timeout",
            AccessErrorCode::ProtocolViolation => "protocol_violation",
            AccessErrorCode::TransactionAborted => "transaction_aborted",
            AccessErrorCode::TransactionClosed => "transaction_closed",
            AccessErrorCode::IllegalState => "illegal_state",
            AccessErrorCode::Corrupt => "corrupt",
            AccessErrorCode::DuplicateKey => "duplicate_key",
            AccessErrorCode::InvalidRow => "invalid_row",
            AccessErrorCode::ReadOnly => "read_only",
            AccessErrorCode::FactoryLoad => "factory_load",
        }
    }
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("{resource_type} '{resource_id}' already exists")]
    AlreadyExists {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("operation '{operation}' is not supported by '{implementation}'")]
    Unsupported {
        operation: String,
        implementation: String,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("lock wait timeout on {lockable}")]
    LockTimeout { lockable: String },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("transaction was aborted and must be rolled back before reuse")]
    TransactionAborted,
    #[error("transaction has been destroyed")]
    TransactionClosed,
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("corrupt data: {0}")]
    Corrupt(String),
    #[error("duplicate key in conglomerate {conglomerate}: {key}")]
    DuplicateKey { conglomerate: i64, key: String },
    #[error("invalid row for conglomerate {conglomerate}: {message}")]
    InvalidRow { conglomerate: i64, message: String },
    #[error("store is read-only")]
    ReadOnly,
    #[error("failed to load implementation '{implementation}': {message}")]
    FactoryLoad {
        implementation: String,
        message: String,
    },
}

impl AccessError {
    pub fn not_found(resource_type: ResourceType, resource_id: impl ToString) -> Self {
        AccessError::NotFound {
            resource_type,
            resource_id: resource_id.to_string(),
        }
    }

    pub fn unsupported(operation: impl Into<String>, implementation: impl Into<String>) -> Self {
        AccessError::Unsupported {
            operation: operation.into(),
            implementation: implementation.into(),
        }
    }

    pub fn code(&self) -> AccessErrorCode {
        match self {
            AccessError::Io(_) => AccessErrorCode::Io,
            AccessError::Encode(_) => AccessErrorCode::Encode,
            AccessError::Decode(_) => AccessErrorCode::Decode,
            AccessError::InvalidConfig { .. } => AccessErrorCode::InvalidConfig,
            AccessError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Conglomerate => AccessErrorCode::ConglomerateNotFound,
                ResourceType::Container => AccessErrorCode::ContainerNotFound,
                ResourceType::Sort => AccessErrorCode::SortNotFound,
                ResourceType::Factory => AccessErrorCode::FactoryNotFound,
                ResourceType::Savepoint => AccessErrorCode::SavepointNotFound,
                ResourceType::Controller => AccessErrorCode::ControllerNotFound,
                ResourceType::Scan => AccessErrorCode::ScanNotFound,
                ResourceType::GlobalTransaction => AccessErrorCode::GlobalTransactionNotFound,
                ResourceType::Property => AccessErrorCode::PropertyNotFound,
            },
            AccessError::AlreadyExists { resource_type, .. } => match resource_type {
                ResourceType::Container => AccessErrorCode::ContainerAlreadyExists,
                ResourceType::Savepoint => AccessErrorCode::SavepointAlreadyExists,
                ResourceType::GlobalTransaction => {
                    AccessErrorCode::GlobalTransactionAlreadyExists
                }
                _ => AccessErrorCode::AlreadyExists,
            },
            AccessError::Unsupported { .. } => AccessErrorCode::Unsupported,
            AccessError::Validation(_) => AccessErrorCode::Validation,
            AccessError::LockTimeout { .. } => AccessErrorCode::LockTimeout,
            AccessError::ProtocolViolation(_) => AccessErrorCode::ProtocolViolation,
            AccessError::TransactionAborted => AccessErrorCode::TransactionAborted,
            AccessError::TransactionClosed => AccessErrorCode::TransactionClosed,
            AccessError::IllegalState(_) => AccessErrorCode::IllegalState,
            AccessError::Corrupt(_) => AccessErrorCode::Corrupt,
            AccessError::DuplicateKey { .. } => AccessErrorCode::DuplicateKey,
            AccessError::InvalidRow { .. } => AccessErrorCode::InvalidRow,
            AccessError::ReadOnly => AccessErrorCode::ReadOnly,
            AccessError::FactoryLoad { .. } => AccessErrorCode::FactoryLoad,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            AccessError::NotFound { .. } => ErrorClass::NotFound,
            AccessError::Unsupported { .. } => ErrorClass::Unsupported,
            AccessError::Validation(_)
            | AccessError::InvalidConfig { .. }
            | AccessError::DuplicateKey { .. }
            | AccessError::InvalidRow { .. } => ErrorClass::Validation,
            AccessError::LockTimeout { .. } => ErrorClass::Timeout,
            AccessError::ProtocolViolation(_)
            | AccessError::TransactionAborted
            | AccessError::TransactionClosed
            | AccessError::IllegalState(_)
            | AccessError::AlreadyExists { .. }
            | AccessError::ReadOnly => ErrorClass::Protocol,
            AccessError::Io(_)
            | AccessError::Encode(_)
            | AccessError::Decode(_)
            | AccessError::Corrupt(_)
            | AccessError::FactoryLoad { .. } => ErrorClass::StorageFailure,
        }
    }

    /// Only lock timeouts may succeed when the caller retries unchanged.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessError, AccessErrorCode, ErrorClass, ResourceType};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(
            AccessErrorCode::ConglomerateNotFound.as_str(),
            "conglomerate_not_found"
        );
        assert_eq!(AccessErrorCode::LockTimeout.as_str(), "lock_timeout");
        assert_eq!(
            AccessErrorCode::ProtocolViolation.as_str(),
            "protocol_violation"
        );
    }

    #[test]
    fn not_found_code_follows_resource_type() {
        let err = AccessError::not_found(ResourceType::Sort, 3);
        assert_eq!(err.code(), AccessErrorCode::SortNotFound);
        assert_eq!(err.code_str(), "sort_not_found");
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[test]
    fn only_timeouts_are_retryable() {
        let timeout = AccessError::LockTimeout {
            lockable: "container(0, 16)".into(),
        };
        assert!(timeout.is_retryable());
        assert!(!AccessError::unsupported("add_column", "btree").is_retryable());
        assert!(!AccessError::ProtocolViolation("nested".into()).is_retryable());
        assert_eq!(
            AccessError::TransactionAborted.class(),
            ErrorClass::Protocol
        );
    }
}
