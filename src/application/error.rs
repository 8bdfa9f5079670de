use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::{
    application::{feed::FeedError, repos::RepoError},
    domain::error::DomainError,
    infra::error::InfraError,
};

/// Error chain attached to responses for the logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const INVALID_INPUT: &str = "invalid_input";
    pub const INVALID_QUERY: &str = "invalid_query";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const FORBIDDEN: &str = "forbidden";
    pub const NOT_FOUND: &str = "not_found";
    pub const UNAVAILABLE: &str = "unavailable";
    pub const DB_TIMEOUT: &str = "db_timeout";
    pub const REPO: &str = "repo_error";
}

#[derive(Debug, Serialize)]
pub struct HttpErrorBody {
    pub error: HttpErrorMessage,
}

#[derive(Debug, Serialize)]
pub struct HttpErrorMessage {
    pub code: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// JSON error response with a diagnostic report for the logging middleware.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    code: &'static str,
    public_message: &'static str,
    hint: Option<String>,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        code: &'static str,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            code,
            public_message,
            hint: None,
            report,
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        code: &'static str,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            code,
            public_message,
            hint: None,
            report,
        }
    }

    /// Expose a detail to the client alongside the public message.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn bad_request(source: &'static str, message: &'static str, hint: String) -> Self {
        Self::new(
            source,
            StatusCode::BAD_REQUEST,
            codes::BAD_REQUEST,
            message,
            hint.clone(),
        )
        .with_hint(hint)
    }

    pub fn unauthorized(source: &'static str) -> Self {
        Self::new(
            source,
            StatusCode::UNAUTHORIZED,
            codes::UNAUTHORIZED,
            "User identity required",
            "request carried no user id",
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = HttpErrorBody {
            error: HttpErrorMessage {
                code: self.code,
                message: self.public_message,
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        self.report.attach(&mut response);
        response
    }
}

const FEED_ERROR_SOURCE: &str = "application::error::feed_error_to_http_error";

impl From<FeedError> for HttpError {
    fn from(error: FeedError) -> Self {
        match error {
            FeedError::InvalidQuery(err) => HttpError::from_error(
                FEED_ERROR_SOURCE,
                StatusCode::BAD_REQUEST,
                codes::INVALID_QUERY,
                "Invalid query parameters",
                &err,
            )
            .with_hint(err.to_string()),
            FeedError::Domain(DomainError::Validation { message }) => HttpError::new(
                FEED_ERROR_SOURCE,
                StatusCode::BAD_REQUEST,
                codes::INVALID_INPUT,
                "Invalid input",
                message.clone(),
            )
            .with_hint(message),
            FeedError::Domain(DomainError::NotFound { entity }) => HttpError::new(
                FEED_ERROR_SOURCE,
                StatusCode::NOT_FOUND,
                codes::NOT_FOUND,
                "Resource not found",
                format!("{entity} not found"),
            ),
            FeedError::NotFound(id) => HttpError::new(
                FEED_ERROR_SOURCE,
                StatusCode::NOT_FOUND,
                codes::NOT_FOUND,
                "Post not found",
                format!("content item `{id}` not found"),
            ),
            err @ FeedError::Forbidden { .. } => HttpError::from_error(
                FEED_ERROR_SOURCE,
                StatusCode::FORBIDDEN,
                codes::FORBIDDEN,
                "Only the author may do that",
                &err,
            ),
            FeedError::Repo(err) => repo_error_to_http(FEED_ERROR_SOURCE, err),
        }
    }
}

/// Map a repository error to a consistent HTTP error response.
pub fn repo_error_to_http(source: &'static str, err: RepoError) -> HttpError {
    match err {
        RepoError::NotFound => HttpError::new(
            source,
            StatusCode::NOT_FOUND,
            codes::NOT_FOUND,
            "Resource not found",
            "resource not found",
        ),
        RepoError::InvalidInput { message } => HttpError::new(
            source,
            StatusCode::BAD_REQUEST,
            codes::INVALID_INPUT,
            "Invalid input",
            message.clone(),
        )
        .with_hint(message),
        RepoError::Timeout => HttpError::new(
            source,
            StatusCode::SERVICE_UNAVAILABLE,
            codes::DB_TIMEOUT,
            "Database timeout",
            "database timeout",
        ),
        err @ RepoError::Unavailable(_) => HttpError::from_error(
            source,
            StatusCode::SERVICE_UNAVAILABLE,
            codes::UNAVAILABLE,
            "Service temporarily unavailable",
            &err,
        ),
        err @ RepoError::Persistence(_) => HttpError::from_error(
            source,
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::REPO,
            "Internal server error",
            &err,
        ),
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Domain(DomainError::NotFound { .. }) => StatusCode::NOT_FOUND,
            AppError::Domain(DomainError::Validation { .. }) | AppError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Infra(InfraError::Database { .. } | InfraError::Cache(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Infra(_) | AppError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            AppError::Domain(DomainError::NotFound { .. }) => "Resource not found",
            AppError::Domain(DomainError::Validation { .. }) | AppError::Validation(_) => {
                "Request could not be processed"
            }
            AppError::Infra(InfraError::Database { .. } | InfraError::Cache(_)) => {
                "Service temporarily unavailable"
            }
            AppError::Infra(InfraError::Migration(_)) => "Database schema could not be migrated",
            AppError::Infra(InfraError::Configuration { .. }) => "Service misconfigured",
            AppError::Infra(InfraError::Bind { .. }) => "Listener could not be bound",
            AppError::Infra(InfraError::Telemetry(_)) => "Logging subsystem could not start",
            AppError::Infra(InfraError::Io(_)) => "I/O failure during request",
            AppError::Unexpected(_) => "Unexpected error occurred",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.presentation_message();
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, message).into_response();
        report.attach(&mut response);
        response
    }
}
