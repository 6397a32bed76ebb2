use std::time::SystemTime;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    NotFound,
    RateLimit,
    Transient,
    Permanent,
}

impl ApiErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ApiErrorClass::RateLimit | ApiErrorClass::Transient)
    }
}

pub(crate) fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
        ApiErrorClass::NotFound
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

pub(crate) fn classify_request_error(err: &reqwest::Error) -> ApiErrorClass {
    if let Some(status) = err.status() {
        classify_api_status(status)
    } else if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Seconds to wait as advertised by a `Retry-After` header (delta or HTTP date).
pub(crate) fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .map(|wait| wait.as_secs())
            .unwrap_or(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::NOT_FOUND),
            ApiErrorClass::NotFound
        );
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::UNPROCESSABLE_ENTITY),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn reads_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after_secs(&headers), Some(7));
    }

    #[test]
    fn past_retry_after_date_means_no_wait() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after_secs(&headers), Some(0));
    }
}
