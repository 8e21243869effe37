//! Error types for consist controllers
//!
//! Errors carry the employer, employee or cluster they relate to so that a
//! failed reconcile can be diagnosed from a single log line or Event.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for consist operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// An adapter call (fetch or create/update/delete) returned an error
    #[error("adapter {controller} failed to {operation}: {message}")]
    Adapter {
        /// Controller name reported by the adapter
        controller: String,
        /// What the adapter was asked to do (e.g. "get expected employees")
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// An adapter-defined equality check failed while diffing
    #[error("comparing {id} failed: {message}")]
    Comparison {
        /// Id of the entity being compared
        id: String,
        /// Description of what failed
        message: String,
    },

    /// Employee name does not have the `name#cluster` shape required by local routing
    #[error("local employee's name invalid: {name}")]
    InvalidEmployeeName {
        /// The raw employee name
        name: String,
    },

    /// No client is configured for the requested member cluster
    #[error("no client configured for cluster {cluster}")]
    UnknownCluster {
        /// Name of the member cluster
        cluster: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// What was being (de)serialized (if known)
        kind: Option<String>,
    },

    /// One or more employer or employee CUD operations reported failed items
    #[error("employer or employees synced failed exist for {employer}")]
    SyncFailures {
        /// namespace/name of the employer
        employer: String,
    },

    /// Several independent operations failed in the same step
    #[error("{}", join_errors(.errors))]
    Aggregate {
        /// The collected errors, in the order they were observed
        errors: Vec<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "reconciler", "webhook")
        context: String,
    },
}

fn join_errors(errors: &[Error]) -> String {
    let parts: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    if parts.len() == 1 {
        parts.join("")
    } else {
        format!("[{}]", parts.join(", "))
    }
}

impl Error {
    /// Create an adapter error
    pub fn adapter(
        controller: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Adapter {
            controller: controller.into(),
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a comparison error for the entity with the given id
    pub fn comparison(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Comparison {
            id: id.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid employee name error
    pub fn invalid_employee_name(name: impl Into<String>) -> Self {
        Self::InvalidEmployeeName { name: name.into() }
    }

    /// Create an unknown cluster error
    pub fn unknown_cluster(cluster: impl Into<String>) -> Self {
        Self::UnknownCluster {
            cluster: cluster.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error naming what was being (de)serialized
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a sync failures error for the given employer
    pub fn sync_failures(employer: impl Into<String>) -> Self {
        Self::SyncFailures {
            employer: employer.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Collapse a set of errors into one.
    ///
    /// Returns `None` when there are no errors and the error itself when
    /// there is exactly one; nested aggregates are flattened.
    pub fn aggregate(errors: impl IntoIterator<Item = Error>) -> Option<Self> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                Error::Aggregate { errors } => flat.extend(errors),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Error::Aggregate { errors: flat }),
        }
    }

    /// True when this is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True when this is a Kubernetes 409 (optimistic concurrency conflict)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Check if this error is retryable
    ///
    /// Name, cluster-configuration and serialization errors need a fix to
    /// the object or the operator and will not go away on retry. Conflicts
    /// are retryable since the next pass re-reads the object.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } if self.is_conflict() => true,
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Adapter { .. } => true,
            Error::Comparison { .. } => true,
            Error::InvalidEmployeeName { .. } => false,
            Error::UnknownCluster { .. } => false,
            Error::Serialization { .. } => false,
            Error::SyncFailures { .. } => true,
            Error::Aggregate { errors } => errors.iter().any(Error::is_retryable),
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
