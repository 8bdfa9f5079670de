use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{error, warn};
use uuid::Uuid;

use crate::application::error::{ErrorReport, HttpError};
use crate::domain::entities::UserId;

pub const USER_ID_HEADER: &str = "x-user-id";

const SOURCE: &str = "infra::http::middleware::identify_user";

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

/// Caller identity taken from the `x-user-id` header. Reads are allowed
/// anonymously; writes call [`RequestUser::require`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestUser(pub Option<UserId>);

impl RequestUser {
    pub fn require(self) -> Result<UserId, HttpError> {
        self.0.ok_or_else(|| HttpError::unauthorized(SOURCE))
    }
}

fn parse_user(headers: &HeaderMap) -> Result<RequestUser, HttpError> {
    let Some(value) = headers.get(USER_ID_HEADER) else {
        return Ok(RequestUser(None));
    };

    let raw = value.to_str().map(str::trim).unwrap_or_default();
    match raw.parse::<UserId>() {
        Ok(id) if id > 0 => Ok(RequestUser(Some(id))),
        _ => Err(HttpError::bad_request(
            SOURCE,
            "Invalid user id",
            format!("`{USER_ID_HEADER}` must be a positive integer"),
        )),
    }
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    response.extensions_mut().insert(ctx);
    response
}

pub async fn identify_user(mut request: Request<Body>, next: Next) -> Response {
    let user = match parse_user(request.headers()) {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    request.extensions_mut().insert(user);
    next.run(request).await
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let user_id = request
        .extensions()
        .get::<RequestUser>()
        .and_then(|user| user.0)
        .map(|id| id.to_string());

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();

    if status.is_client_error() || status.is_server_error() {
        let elapsed_ms = start.elapsed().as_millis();
        let report = response.extensions_mut().remove::<ErrorReport>();
        let (source, messages) = match report {
            Some(report) => (report.source, report.messages),
            None => ("unknown", Vec::new()),
        };
        let detail = messages
            .first()
            .cloned()
            .unwrap_or_else(|| "no diagnostic available".to_string());

        if status.is_server_error() {
            error!(
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                request_id = request_id,
                user_id = user_id.as_deref().unwrap_or(""),
                "request failed",
            );
        } else {
            warn!(
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                request_id = request_id,
                user_id = user_id.as_deref().unwrap_or(""),
                "client request error",
            );
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderValue, StatusCode};

    use super::*;

    #[test]
    fn missing_header_is_anonymous() {
        let user = parse_user(&HeaderMap::new()).expect("anonymous");
        assert_eq!(user, RequestUser(None));
        let err = user.require().expect_err("writes need a user");
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn numeric_header_identifies_user() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static(" 42 "));
        let user = parse_user(&headers).expect("valid id");
        assert_eq!(user.require().expect("present"), 42);
    }

    #[test]
    fn malformed_header_is_rejected() {
        for raw in ["abc", "-3", "0"] {
            let mut headers = HeaderMap::new();
            headers.insert(USER_ID_HEADER, HeaderValue::from_static(raw));
            let err = parse_user(&headers).expect_err("rejected");
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        }
    }
}
