use reqwest::StatusCode;

use crate::services::error::ClientError;

/// Idempotent reads: retry on transient transport failures and overload statuses.
pub(super) fn should_retry_read(err: &ClientError) -> bool {
    match err {
        ClientError::Transport(e) => e.is_timeout() || e.is_connect(),
        ClientError::Http { status, .. } => StatusCode::from_u16(*status)
            .map(is_transient_status)
            .unwrap_or(false),
        _ => false,
    }
}

/// Message submission: only when the request never reached the server, so a
/// message is never stored twice.
pub(super) fn should_retry_submission(err: &ClientError) -> bool {
    matches!(err, ClientError::Transport(e) if e.is_connect())
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}
