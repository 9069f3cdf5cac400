use std::thread;
use std::time::Duration;

use reqwest::blocking::{RequestBuilder, Response};
use tracing::debug;

use crate::error::ImpactError;

const MAX_RETRIES: usize = 3;
const BASE_DELAY_MS: u64 = 200;

/// Sends the request built by `make_req`, retrying throttling, 5xx gateway
/// statuses, timeouts and connect failures with a linear backoff. Transport
/// errors that survive the retries are mapped through `transport_error`.
pub fn send_with_retries<F>(
    mut make_req: F,
    transport_error: fn(String) -> ImpactError,
) -> Result<Response, ImpactError>
where
    F: FnMut() -> RequestBuilder,
{
    let mut attempt = 0usize;
    loop {
        match make_req().send() {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if attempt < MAX_RETRIES && is_retryable_status(status) {
                    debug!(status, attempt, "retrying request");
                    backoff(attempt);
                    attempt += 1;
                    continue;
                }
                return Ok(resp);
            }
            Err(err) => {
                if attempt < MAX_RETRIES && (err.is_timeout() || err.is_connect()) {
                    debug!(error = %err, attempt, "retrying request");
                    backoff(attempt);
                    attempt += 1;
                    continue;
                }
                return Err(transport_error(err.to_string()));
            }
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn backoff(attempt: usize) {
    thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
}
