//! Contains the error type used by this application
//! which wraps many different types of suberrors, so we can return a consistent type.

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use log::error;
use serde::Serialize;
use std::fmt::{self, Formatter};

/// Every failure an operation can surface to a caller. Variants map 1:1 to
/// HTTP status codes; the carried string becomes the response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The requested entity does not exist
    NotFound(String),
    /// A uniqueness rule was violated (duplicate identifier, tag, or
    /// in-flight link)
    Conflict(String),
    /// Missing or invalid credential or token
    Unauthorized(String),
    /// Authenticated, but insufficient role or department scope
    Forbidden(String),
    /// Malformed request body or enum value
    InvalidInput(String),
    /// Unexpected store failure
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorMessage<'a> {
    message: &'a str,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Error::NotFound(m)
            | Error::Conflict(m)
            | Error::Unauthorized(m)
            | Error::Forbidden(m)
            | Error::InvalidInput(m) => f.write_str(m),
            // internal detail stays in the logs, not the response
            Error::Internal(_) => f.write_str("internal server error"),
        }
    }
}

impl std::error::Error for Error {}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let Error::Internal(detail) = self {
            error!("internal error while handling request: {}", detail);
        }
        HttpResponse::build(self.status_code()).json(ErrorMessage {
            message: &self.to_string(),
        })
    }
}

impl From<diesel::result::Error> for Error {
    fn from(e: diesel::result::Error) -> Error {
        use diesel::result::{DatabaseErrorKind, Error as DieselError};
        match e {
            DieselError::NotFound => Error::NotFound("entity not found".into()),
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                Error::Conflict(format!("uniqueness violation: {}", info.message()))
            }
            e => Error::Internal(format!("database failure: {}", e)),
        }
    }
}

impl From<diesel::r2d2::PoolError> for Error {
    fn from(e: diesel::r2d2::PoolError) -> Error {
        Error::Internal(format!("connection pool failure: {}", e))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Error {
        Error::Internal(format!("blocking task failure: {}", e))
    }
}
