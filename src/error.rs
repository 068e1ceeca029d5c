//! Error types for the streaming ETL pipeline.
//!
//! This module provides a unified error type [`EtlError`] that covers every
//! failure the pipeline can hit while fetching chain data, running jobs,
//! exporting entities and driving the sync/reorg controllers.
//!
//! # Error classes
//!
//! Retry behaviour is not decided per variant at the call site. Every error
//! reports an [`ErrorClass`] through [`EtlError::class`]:
//!
//! - [`ErrorClass::Retriable`]: transient transport failures (timeouts,
//!   connection resets, rate limits). The batch executor shrinks and retries
//!   these, the controllers retry them up to a bound.
//! - [`ErrorClass::Crashable`]: protocol-level failures that must stop the
//!   process immediately (malformed request, historical state unavailable).
//! - [`ErrorClass::Fatal`]: everything else. Logged and propagated, never
//!   retried.
//!
//! # Example
//!
//! ```
//! use eth_stream_etl::error::{ErrorClass, EtlError, EtlResult};
//!
//! fn check_range(start: u64, end: u64) -> EtlResult<()> {
//!     if start > end {
//!         return Err(EtlError::state(
//!             format!("invalid block range {start}..={end}"),
//!             None,
//!         ));
//!     }
//!     Ok(())
//! }
//!
//! let err = check_range(10, 1).unwrap_err();
//! assert_eq!(err.class(), ErrorClass::Fatal);
//! ```

use std::fmt;

/// Result type alias using [`EtlError`].
pub type EtlResult<T> = Result<T, EtlError>;

/// Boxed source error carried by most variants.
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// JSON-RPC error codes providers use for "slow down".
const RATE_LIMIT_CODES: &[i64] = &[-32005, -32090, 429];

/// JSON-RPC error codes that indicate the request itself is broken.
const MALFORMED_REQUEST_CODES: &[i64] = &[-32600, -32601, -32602, -32700];

/// Message fragments from nodes that pruned the requested state.
const STATE_UNAVAILABLE_HINTS: &[&str] = &[
    "missing trie node",
    "header not found",
    "historical state",
    "state is not available",
];

/// Message fragments that indicate a busy or overloaded server.
const SERVER_BUSY_HINTS: &[&str] = &[
    "rate limit",
    "too many requests",
    "capacity",
    "timeout",
    "timed out",
    "try again",
    "busy",
];

/// Retry classification for an [`EtlError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Transient; eligible for shrink-and-retry and bounded controller retry.
    Retriable,
    /// Unexpected protocol failure; the process must stop.
    Crashable,
    /// Everything else; propagated without retry.
    Fatal,
}

impl ErrorClass {
    /// Process exit status for a failure of this class (`EX_TEMPFAIL`,
    /// `EX_SOFTWARE`, or 1).
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Retriable => 75,
            Self::Crashable => 70,
            Self::Fatal => 1,
        }
    }

    /// Inverse of [`exit_code`](Self::exit_code); `None` for success.
    #[must_use]
    pub const fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            0 => None,
            75 => Some(Self::Retriable),
            70 => Some(Self::Crashable),
            _ => Some(Self::Fatal),
        }
    }
}

/// Unified error type for the ETL pipeline.
#[derive(Debug)]
pub enum EtlError {
    /// Configuration or environment variable errors.
    ConfigError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Non-transient JSON-RPC failures (execution errors, unexpected payloads).
    RpcError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Transient transport failures.
    ///
    /// Variants include:
    /// - Connection reset or refused
    /// - Request timeout
    /// - HTTP 429 / 5xx responses
    /// - Rate-limit JSON-RPC error codes
    TransportError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Failures that must stop the process immediately.
    ///
    /// Variants include:
    /// - Malformed JSON-RPC request
    /// - Historical state pruned by the node
    CrashableError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Payload decoding or data corruption errors.
    DecodingError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Invariant violations in pipeline state.
    StateError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Database operation errors.
    DatabaseError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Export sink failures.
    ExportError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Job wiring errors (dependency cycles, unknown entity types).
    JobError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// A sub-range exceeded its deadline.
    Timeout {
        /// Human-readable error message
        message: String,
    },

    /// Work was abandoned because shutdown was requested.
    Cancelled {
        /// Human-readable error message
        message: String,
    },
}

macro_rules! constructor {
    ($(#[$doc:meta])* $name:ident => $variant:ident) => {
        $(#[$doc])*
        #[must_use]
        pub fn $name(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
            Self::$variant {
                message: message.into(),
                source,
            }
        }
    };
}

impl EtlError {
    constructor!(
        /// Create a new configuration error.
        ///
        /// # Example
        ///
        /// ```
        /// use eth_stream_etl::error::EtlError;
        ///
        /// let err = EtlError::config("PROVIDER_URI not set", None);
        /// assert!(matches!(err, EtlError::ConfigError { .. }));
        /// ```
        config => ConfigError
    );
    constructor!(
        /// Create a new (non-transient) RPC error.
        rpc => RpcError
    );
    constructor!(
        /// Create a new transient transport error.
        ///
        /// # Example
        ///
        /// ```
        /// use eth_stream_etl::error::{ErrorClass, EtlError};
        ///
        /// let err = EtlError::transport("connection reset", None);
        /// assert_eq!(err.class(), ErrorClass::Retriable);
        /// ```
        transport => TransportError
    );
    constructor!(
        /// Create a new crashable error.
        crashable => CrashableError
    );
    constructor!(
        /// Create a new decoding error.
        decoding => DecodingError
    );
    constructor!(
        /// Create a new state error.
        state => StateError
    );
    constructor!(
        /// Create a new database error.
        database => DatabaseError
    );
    constructor!(
        /// Create a new export error.
        export => ExportError
    );
    constructor!(
        /// Create a new job wiring error.
        job => JobError
    );

    /// Create a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a cancellation error.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Classify a JSON-RPC error object returned by a node.
    ///
    /// Rate-limit codes and server-busy messages are transient, malformed
    /// requests and pruned-state responses are crashable, anything else is
    /// an ordinary RPC error.
    ///
    /// # Example
    ///
    /// ```
    /// use eth_stream_etl::error::{ErrorClass, EtlError};
    ///
    /// let err = EtlError::from_rpc_code(-32000, "missing trie node abc", "eth_getBalance");
    /// assert_eq!(err.class(), ErrorClass::Crashable);
    ///
    /// let err = EtlError::from_rpc_code(-32005, "limit exceeded", "eth_getLogs");
    /// assert_eq!(err.class(), ErrorClass::Retriable);
    /// ```
    #[must_use]
    pub fn from_rpc_code(code: i64, message: &str, method: &str) -> Self {
        let lowered = message.to_ascii_lowercase();
        let text = format!("{method} failed with code {code}: {message}");

        if MALFORMED_REQUEST_CODES.contains(&code)
            || STATE_UNAVAILABLE_HINTS.iter().any(|hint| lowered.contains(hint))
        {
            return Self::crashable(text, None);
        }

        if RATE_LIMIT_CODES.contains(&code)
            || SERVER_BUSY_HINTS.iter().any(|hint| lowered.contains(hint))
        {
            return Self::transport(text, None);
        }

        Self::rpc(text, None)
    }

    /// Classify an HTTP status returned by the RPC endpoint.
    #[must_use]
    pub fn from_http_status(status: u16, body: &str) -> Self {
        let text = format!("HTTP {status}: {body}");
        match status {
            408 | 429 | 500..=599 => Self::transport(text, None),
            400 | 404 | 405 | 413 => Self::crashable(text, None),
            _ => Self::rpc(text, None),
        }
    }

    /// Retry classification of this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::TransportError { .. } => ErrorClass::Retriable,
            Self::CrashableError { .. } => ErrorClass::Crashable,
            _ => ErrorClass::Fatal,
        }
    }

    /// Shorthand for `class() == ErrorClass::Retriable`.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self.class(), ErrorClass::Retriable)
    }

    /// Shorthand for `class() == ErrorClass::Crashable`.
    #[must_use]
    pub const fn is_crashable(&self) -> bool {
        matches!(self.class(), ErrorClass::Crashable)
    }

    /// Shallow copy that keeps variant and message but drops the source.
    ///
    /// Used where one failure has to be reported to several observers.
    #[must_use]
    pub fn detached(&self) -> Self {
        let message = self.message().to_string();
        match self {
            Self::ConfigError { .. } => Self::config(message, None),
            Self::RpcError { .. } => Self::rpc(message, None),
            Self::TransportError { .. } => Self::transport(message, None),
            Self::CrashableError { .. } => Self::crashable(message, None),
            Self::DecodingError { .. } => Self::decoding(message, None),
            Self::StateError { .. } => Self::state(message, None),
            Self::DatabaseError { .. } => Self::database(message, None),
            Self::ExportError { .. } => Self::export(message, None),
            Self::JobError { .. } => Self::job(message, None),
            Self::Timeout { .. } => Self::timeout(message),
            Self::Cancelled { .. } => Self::cancelled(message),
        }
    }

    /// The human-readable message without the category prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::ConfigError { message, .. }
            | Self::RpcError { message, .. }
            | Self::TransportError { message, .. }
            | Self::CrashableError { message, .. }
            | Self::DecodingError { message, .. }
            | Self::StateError { message, .. }
            | Self::DatabaseError { message, .. }
            | Self::ExportError { message, .. }
            | Self::JobError { message, .. }
            | Self::Timeout { message }
            | Self::Cancelled { message } => message,
        }
    }
}

impl fmt::Display for EtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigError { message, .. } => write!(f, "Configuration error: {message}"),
            Self::RpcError { message, .. } => write!(f, "RPC error: {message}"),
            Self::TransportError { message, .. } => write!(f, "Transport error: {message}"),
            Self::CrashableError { message, .. } => write!(f, "Crashable error: {message}"),
            Self::DecodingError { message, .. } => write!(f, "Decoding error: {message}"),
            Self::StateError { message, .. } => write!(f, "State error: {message}"),
            Self::DatabaseError { message, .. } => write!(f, "Database error: {message}"),
            Self::ExportError { message, .. } => write!(f, "Export error: {message}"),
            Self::JobError { message, .. } => write!(f, "Job error: {message}"),
            Self::Timeout { message } => write!(f, "Timeout: {message}"),
            Self::Cancelled { message } => write!(f, "Cancelled: {message}"),
        }
    }
}

impl std::error::Error for EtlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConfigError { source, .. }
            | Self::RpcError { source, .. }
            | Self::TransportError { source, .. }
            | Self::CrashableError { source, .. }
            | Self::DecodingError { source, .. }
            | Self::StateError { source, .. }
            | Self::DatabaseError { source, .. }
            | Self::ExportError { source, .. }
            | Self::JobError { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &dyn std::error::Error),
            Self::Timeout { .. } | Self::Cancelled { .. } => None,
        }
    }
}

/// Convert from `eyre::Report` to `EtlError`.
///
/// Reports carry no classification, so they are treated as fatal state
/// errors. The outermost context becomes the message and the report itself
/// stays reachable through [`std::error::Error::source`].
impl From<eyre::Report> for EtlError {
    fn from(err: eyre::Report) -> Self {
        Self::StateError {
            message: err.to_string(),
            source: Some(err.into()),
        }
    }
}

impl From<sqlx::Error> for EtlError {
    fn from(err: sqlx::Error) -> Self {
        Self::database(err.to_string(), Some(Box::new(err)))
    }
}
