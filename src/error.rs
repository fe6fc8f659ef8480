use crate::store::StoreError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use log::{debug, error};
use serde_json::json;
use std::io;
use thiserror::Error;
use zip::result::ZipError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Not Authorized: {0}")]
    NotAuthorized(String),
    #[error("Not Authenticated")]
    AuthenticationRejected,
    #[error("Malformed request: {0}")]
    MalformedInput(String),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Payload too large: {0}")]
    TooLarge(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Hash(#[from] argon2::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Zip(#[from] ZipError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedInput(message.into())
    }

    /// Errors the client caused, as opposed to faults of the server itself.
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::NotAuthorized(_) => StatusCode::FORBIDDEN,
            Error::AuthenticationRejected => StatusCode::UNAUTHORIZED,
            Error::MalformedInput(_) | Error::Zip(_) => StatusCode::BAD_REQUEST,
            Error::UnsupportedOperation(_) => StatusCode::METHOD_NOT_ALLOWED,
            Error::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Store(_) | Error::Hash(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = if self.is_client_error() {
            debug!("Rejected request: {}", self);
            self.to_string()
        } else {
            error!("Internal failure: {}", self);
            "Internal error".to_string()
        };
        let mut response = HttpResponse::build(status);
        if let Error::AuthenticationRejected = self {
            response.insert_header(("WWW-Authenticate", "Basic realm=\"cogs\""));
        }
        response.json(json!({
            "status": status.as_u16(),
            "message": message,
        }))
    }
}
