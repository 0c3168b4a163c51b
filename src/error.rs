use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use tables::OrmError;

use crate::cache::CacheError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("disallowed host: {0}")]
    DisallowedHost(String),
    /// Neither storage nor the default table knows the key.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),
    /// A stored value does not parse under its declared type.
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
    #[error("parameter {0} is system controlled")]
    ParameterAccess(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    /// A background task died before finishing.
    #[error("task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Storage(#[from] OrmError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attached to every error response so the containment layer can tell which
/// kind of failure produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureKind(pub &'static str);

impl FailureKind {
    pub const PANIC: FailureKind = FailureKind("Panic");

    /// Kinds a client can trigger on purpose; they never trip the breaker.
    pub fn is_expected(&self) -> bool {
        matches!(self.0, "NotFound" | "Validation" | "DisallowedHost")
    }
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        FailureKind(match self {
            Error::NotFound(_) => "NotFound",
            Error::Validation(_) => "Validation",
            Error::DisallowedHost(_) => "DisallowedHost",
            Error::UnknownParameter(_) => "UnknownParameter",
            Error::InvalidValue { .. } => "InvalidValue",
            Error::ParameterAccess(_) => "ParameterAccess",
            Error::MalformedPayload(_) => "MalformedPayload",
            Error::Task(_) => "Task",
            Error::Cache(_) => "Cache",
            Error::Storage(_) => "Storage",
        })
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) | Error::InvalidValue { .. } | Error::MalformedPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::DisallowedHost(_) => StatusCode::BAD_REQUEST,
            Error::ParameterAccess(_) => StatusCode::FORBIDDEN,
            Error::UnknownParameter(_) | Error::Task(_) | Error::Cache(_) | Error::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = if status.is_server_error() {
            tracing::error!(kind = self.kind().0, error = %self, "Application error");
            "Something went wrong".to_string()
        } else {
            tracing::debug!(kind = self.kind().0, error = %self);
            self.to_string()
        };

        let mut response = (status, Html(body)).into_response();
        response.extensions_mut().insert(self.kind());
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_carry_their_kind() {
        let response = Error::Storage(OrmError::Unknown).into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.extensions().get::<FailureKind>(),
            Some(&FailureKind("Storage"))
        );
    }

    #[test]
    fn client_errors_are_expected() {
        assert!(Error::NotFound("x".into()).kind().is_expected());
        assert!(Error::Validation("x".into()).kind().is_expected());
        assert!(!Error::Cache(CacheError::Backend("down".into())).kind().is_expected());
        assert!(!FailureKind::PANIC.is_expected());
    }
}
