//! Status values and error types
//!
//! Loop callbacks speak [`Status`]: they are told why they are being invoked
//! and report failure by returning one. Everything the caller of a worker API
//! can get back synchronously is a [`WorkerError`].

use std::fmt;

/// Canonical status codes carried by [`Status`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Success
    Ok,
    /// The operation was cancelled, typically because the worker shut down
    Cancelled,
    /// A deadline passed before the awaited condition held
    DeadlineExceeded,
    /// The loop is no longer accepting work
    Aborted,
    /// A fixed capacity was exhausted
    ResourceExhausted,
    /// The request was malformed
    InvalidArgument,
    /// The request was made in a state that does not allow it
    FailedPrecondition,
    /// An invariant broke inside user code (e.g. a panic)
    Internal,
    /// Anything else
    Unknown,
}

impl StatusCode {
    /// Short lowercase name used in display output
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Ok => "ok",
            StatusCode::Cancelled => "cancelled",
            StatusCode::DeadlineExceeded => "deadline exceeded",
            StatusCode::Aborted => "aborted",
            StatusCode::ResourceExhausted => "resource exhausted",
            StatusCode::InvalidArgument => "invalid argument",
            StatusCode::FailedPrecondition => "failed precondition",
            StatusCode::Internal => "internal",
            StatusCode::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status code plus an optional human-readable message.
///
/// `Status` is both the "why are you being called" argument handed to loop
/// callbacks and the error value they return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    /// Create a status with a code and message
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The success status
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    /// Cancellation status
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    /// Timeout status
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }

    /// Internal failure status
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    /// Unclassified failure status
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unknown, message)
    }

    /// Status code
    pub fn code(&self) -> StatusCode {
        self.code
    }

    /// Message (may be empty)
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this is the success status
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Convert to a `Result`, mapping the ok status to `Ok(())`
    pub fn into_result(self) -> std::result::Result<(), Status> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for Status {}

impl From<RegistrationError> for Status {
    fn from(err: RegistrationError) -> Self {
        let code = match err {
            RegistrationError::ResourceExhausted { .. } => StatusCode::ResourceExhausted,
            RegistrationError::Aborted => StatusCode::Aborted,
            RegistrationError::InvalidArgument(_) => StatusCode::InvalidArgument,
        };
        Status::new(code, err.to_string())
    }
}

/// A step engine refused a registration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// The engine already holds its maximum number of registrations
    #[error("engine is full ({limit} pending registrations)")]
    ResourceExhausted {
        /// Configured capacity
        limit: usize,
    },

    /// The engine was shut down and accepts no further work
    #[error("engine has been shut down")]
    Aborted,

    /// The registration itself was malformed
    #[error("invalid registration: {0}")]
    InvalidArgument(String),
}

/// Programmer errors in driving a worker's lifecycle
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionViolation {
    /// `start` or `run_on_current_thread` called on a worker that already ran
    #[error("worker has already been run")]
    AlreadyRun,

    /// `start` called on a worker configured for an adopted thread
    #[error("worker is not configured with an owned thread")]
    NotOwnedThread,

    /// `run_on_current_thread` called on a worker configured to own its thread
    #[error("worker is configured with an owned thread")]
    OwnedThread,

    /// `wait_for_shutdown` called from the loop thread it would wait for
    #[error("cannot wait for shutdown from the worker's own loop thread")]
    ShutdownFromLoopThread,
}

/// Errors surfaced by the worker API
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// A lifecycle call was made in a state that forbids it
    #[error("precondition violation: {0}")]
    Precondition(#[from] PreconditionViolation),

    /// The step engine rejected a registration
    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),

    /// The step engine could not make progress; the loop exited abnormally
    #[error("engine step failed: {0}")]
    EngineStep(Status),

    /// The OS refused to spawn the worker thread
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl Clone for WorkerError {
    fn clone(&self) -> Self {
        match self {
            WorkerError::Precondition(v) => WorkerError::Precondition(*v),
            WorkerError::Registration(e) => WorkerError::Registration(e.clone()),
            WorkerError::EngineStep(s) => WorkerError::EngineStep(s.clone()),
            WorkerError::Spawn(e) => {
                WorkerError::Spawn(std::io::Error::new(e.kind(), e.to_string()))
            }
        }
    }
}

/// Result alias for worker operations
pub type Result<T> = std::result::Result<T, WorkerError>;
