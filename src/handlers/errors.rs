//! # Faults
//!
//! Classified request errors carrying an HTTP status. Handlers raise them,
//! the dispatcher raises them, and the error chain turns them into a
//! response.

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

/// Result type for handler invocations
pub type FaultResult<T> = Result<T, Fault>;

/// Fault classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    BadRequest,
    Unauthorized,
    PaymentRequired,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    InternalError,
    NotImplemented,
}

impl FaultCode {
    /// Get HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            FaultCode::BadRequest => 400,
            FaultCode::Unauthorized => 401,
            FaultCode::PaymentRequired => 402,
            FaultCode::Forbidden => 403,
            FaultCode::NotFound => 404,
            FaultCode::MethodNotAllowed => 405,
            FaultCode::InternalError => 500,
            FaultCode::NotImplemented => 501,
        }
    }

    /// Map an HTTP status back to a fault code
    pub fn from_status(status: u16) -> Option<Self> {
        let code = match status {
            400 => FaultCode::BadRequest,
            401 => FaultCode::Unauthorized,
            402 => FaultCode::PaymentRequired,
            403 => FaultCode::Forbidden,
            404 => FaultCode::NotFound,
            405 => FaultCode::MethodNotAllowed,
            500 => FaultCode::InternalError,
            501 => FaultCode::NotImplemented,
            _ => return None,
        };
        Some(code)
    }

    /// Client faults are the 4xx family
    pub fn is_client(&self) -> bool {
        self.status_code() < 500
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultCode::BadRequest => "BAD_REQUEST",
            FaultCode::Unauthorized => "UNAUTHORIZED",
            FaultCode::PaymentRequired => "PAYMENT_REQUIRED",
            FaultCode::Forbidden => "FORBIDDEN",
            FaultCode::NotFound => "NOT_FOUND",
            FaultCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            FaultCode::InternalError => "INTERNAL_ERROR",
            FaultCode::NotImplemented => "NOT_IMPLEMENTED",
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Cause = Box<dyn StdError + Send + Sync + 'static>;

fn message_suffix(message: &Option<String>) -> String {
    match message {
        Some(message) => format!(": {}", message),
        None => String::new(),
    }
}

/// A classified error with a status code, an optional message and an
/// optional cause
#[derive(Debug, Error)]
#[error("{} {}{}", .code.status_code(), .code, message_suffix(.message))]
pub struct Fault {
    code: FaultCode,
    message: Option<String>,
    #[source]
    cause: Option<Cause>,
}

impl Fault {
    pub fn new(code: FaultCode) -> Self {
        Self {
            code,
            message: None,
            cause: None,
        }
    }

    pub fn with_message(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            cause: None,
        }
    }

    /// Attach the error that caused this fault
    pub fn caused_by(mut self, cause: impl Into<Cause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with_message(FaultCode::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::with_message(FaultCode::BadRequest, message)
    }

    /// Wrap an unexpected error as an internal fault; its text becomes the message
    pub fn internal(cause: impl Into<Cause>) -> Self {
        let cause = cause.into();
        Self {
            code: FaultCode::InternalError,
            message: Some(cause.to_string()),
            cause: Some(cause),
        }
    }

    pub fn code(&self) -> FaultCode {
        self.code
    }

    pub fn status_code(&self) -> u16 {
        self.code.status_code()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }
}
