//! Common error types for the tern engine.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`TernError`].
pub type TernResult<T> = Result<T, TernError>;

/// Coarse classification of a [`TernError`].
///
/// Callers branch on the kind rather than on individual variants; the kind
/// survives [`TernError::Context`] wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A network, container, task or driver does not exist.
    NotFound,
    /// An identifier prefix matched more than one resource.
    Ambiguous,
    /// The operation is not allowed on this resource.
    Forbidden,
    /// The requested state conflicts with the current one.
    Conflict,
    /// On-disk or requested configuration is malformed or unsupported.
    InvalidConfiguration,
    /// The caller supplied an unusable argument.
    InvalidArgument,
    /// An external collaborator (filter backend, CNI, runtime) failed.
    External,
    /// An internal invariant was violated.
    Internal,
}

/// Errors produced by the network engine.
#[derive(Error, Diagnostic, Debug)]
pub enum TernError {
    /// Network not found.
    #[error("No such network: {query}")]
    #[diagnostic(code(tern::network::not_found))]
    NetworkNotFound {
        /// The name or ID that was looked up.
        query: String,
    },

    /// Container not found.
    #[error("No such container: {query}")]
    #[diagnostic(code(tern::container::not_found))]
    ContainerNotFound {
        /// The name or ID that was looked up.
        query: String,
    },

    /// The container has no task, so it has no network namespace yet.
    #[error("No task found for container: {id}")]
    #[diagnostic(code(tern::task::not_found))]
    TaskNotFound {
        /// The container ID.
        id: String,
    },

    /// No plugin backs the requested network driver.
    #[error("Plugin \"{driver}\" not found")]
    #[diagnostic(
        code(tern::driver::not_found),
        help("Supported drivers are provided by the CNI plugins installed on the host")
    )]
    PluginNotFound {
        /// The driver name.
        driver: String,
    },

    /// Sentinel raised by a network store that cannot handle a driver.
    #[error("Unsupported network driver: {driver}")]
    #[diagnostic(code(tern::driver::unsupported))]
    UnsupportedDriver {
        /// The driver name.
        driver: String,
    },

    /// An ID prefix matched several resources.
    #[error("Multiple IDs found with provided prefix: {query}")]
    #[diagnostic(
        code(tern::ambiguous),
        help("Use a longer ID prefix or the full name")
    )]
    Ambiguous {
        /// The prefix that was looked up.
        query: String,
        /// Names of every match.
        matches: Vec<String>,
    },

    /// The network still has containers attached.
    #[error("Network {network} is in use by container {container}")]
    #[diagnostic(
        code(tern::network::in_use),
        help("Disconnect or remove the container first")
    )]
    NetworkInUse {
        /// The network name.
        network: String,
        /// One of the containers using it.
        container: String,
    },

    /// Pre-defined networks have no backing config file and cannot be removed.
    #[error("{network} is a pre-defined network and cannot be removed")]
    #[diagnostic(code(tern::network::predefined))]
    PredefinedNetwork {
        /// The network name.
        network: String,
    },

    /// The container is already attached to the network.
    #[error("Container {container} is already connected to network {network}")]
    #[diagnostic(code(tern::network::already_connected))]
    AlreadyConnected {
        /// The network name.
        network: String,
        /// The container ID.
        container: String,
    },

    /// The container task is in a state that does not allow attachment.
    #[error("Cannot connect container {container} in state {state}")]
    #[diagnostic(code(tern::task::invalid_state))]
    InvalidTaskState {
        /// The container ID.
        container: String,
        /// The reported task state.
        state: String,
    },

    /// Network creation reported success without a usable network.
    #[error("Network ID not found after creating network {network}")]
    #[diagnostic(
        code(tern::network::missing_id),
        help("This is a bug in the network store, please report it")
    )]
    MissingNetworkId {
        /// The requested network name.
        network: String,
    },

    /// Configuration is malformed or unsupported.
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(tern::config))]
    InvalidConfiguration {
        /// The error message.
        message: String,
    },

    /// The caller supplied an unusable argument.
    #[error("Invalid argument: {message}")]
    #[diagnostic(code(tern::invalid_argument))]
    InvalidArgument {
        /// The error message.
        message: String,
    },

    /// An external collaborator failed.
    #[error("{operation} failed: {message}")]
    #[diagnostic(code(tern::external))]
    External {
        /// The operation that failed.
        operation: String,
        /// The collaborator's error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(tern::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(tern::serialization))]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(tern::internal),
        help("This is a bug, please report it at https://github.com/tern-net/tern/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },

    /// An error annotated with the step that produced it.
    #[error("{context}: {source}")]
    #[diagnostic(code(tern::context))]
    Context {
        /// What was being done.
        context: String,
        /// The underlying error.
        #[source]
        source: Box<TernError>,
    },
}

impl TernError {
    /// Classify this error, looking through any context wrapping.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NetworkNotFound { .. }
            | Self::ContainerNotFound { .. }
            | Self::TaskNotFound { .. }
            | Self::PluginNotFound { .. }
            | Self::UnsupportedDriver { .. } => ErrorKind::NotFound,
            Self::Ambiguous { .. } => ErrorKind::Ambiguous,
            Self::NetworkInUse { .. } | Self::PredefinedNetwork { .. } => ErrorKind::Forbidden,
            Self::AlreadyConnected { .. } | Self::InvalidTaskState { .. } => ErrorKind::Conflict,
            Self::InvalidConfiguration { .. } | Self::Serialization(_) => {
                ErrorKind::InvalidConfiguration
            }
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::External { .. } | Self::Io(_) => ErrorKind::External,
            Self::MissingNetworkId { .. } | Self::Internal { .. } => ErrorKind::Internal,
            Self::Context { source, .. } => source.kind(),
        }
    }

    /// Returns true if this error (or the error it wraps) is a not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// The innermost error, with all context stripped.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Wrap this error with the step that produced it.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for [`TernError::InvalidConfiguration`].
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Shorthand for [`TernError::External`].
    pub fn external(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::External {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for TernError {
    fn from(err: serde_json::Error) -> Self {
        TernError::Serialization(err.to_string())
    }
}

/// Attach step context to the error side of a [`TernResult`].
pub trait ResultExt<T> {
    /// Wrap the error with a fixed context string.
    fn context(self, context: impl Into<String>) -> TernResult<T>;

    /// Wrap the error with a lazily built context string.
    fn with_context<F, S>(self, f: F) -> TernResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for TernResult<T> {
    fn context(self, context: impl Into<String>) -> TernResult<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F, S>(self, f: F) -> TernResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}
