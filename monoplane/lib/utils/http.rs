use std::time::Duration;

use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::RetryTransientMiddleware;

use crate::{MonoplaneError, MonoplaneResult};

use super::backoff_policy;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an HTTP client that retries transient errors with exponential backoff.
///
/// `timeout` bounds each attempt.
pub fn build_http_client(
    timeout: Duration,
    max_retries: u32,
    min_backoff: Duration,
    max_backoff: Duration,
) -> MonoplaneResult<ClientWithMiddleware> {
    let retry_policy = backoff_policy(max_retries, min_backoff, max_backoff);
    let client = Client::builder().timeout(timeout).build()?;

    Ok(ClientBuilder::new(client)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build())
}

/// Maps a failed send to `Unavailable` when the failure was transient.
pub fn map_send_error(target: &str, error: reqwest_middleware::Error) -> MonoplaneError {
    let error = MonoplaneError::HttpMiddleware(error);
    if error.is_transient() {
        MonoplaneError::Unavailable(format!("{target} unreachable: {error}"))
    } else {
        error
    }
}
