//! Mapping from HTTP outcomes to `GatewayError`.

use reqwest::StatusCode;

use crate::application::ports::GatewayError;

/// Longest response body kept in an error message.
const MAX_BODY_IN_ERROR: usize = 200;

/// Map a non-success response to a gateway error.
pub fn from_status(
    status: StatusCode,
    target: &str,
    body: &str,
    retry_after_secs: Option<u64>,
) -> GatewayError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            GatewayError::Unauthorized(format!("{target}: {}", snippet(body)))
        }
        StatusCode::NOT_FOUND => GatewayError::NotFound(target.to_string()),
        StatusCode::TOO_MANY_REQUESTS => GatewayError::RateLimited { retry_after_secs },
        other => GatewayError::Server {
            status: other.as_u16(),
            message: snippet(body).to_string(),
        },
    }
}

/// Map a transport failure.
pub fn from_reqwest(err: &reqwest::Error) -> GatewayError {
    if err.is_decode() {
        GatewayError::Decode(err.to_string())
    } else {
        GatewayError::Network(err.to_string())
    }
}

fn snippet(body: &str) -> &str {
    let body = body.trim();
    if body.len() <= MAX_BODY_IN_ERROR {
        return body;
    }
    let mut end = MAX_BODY_IN_ERROR;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
