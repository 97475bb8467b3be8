//! Per-request deadline.
//!
//! The guard creates a [`Deadline`], hands it to the handler through request
//! extensions and races the handler against it. On expiry the deadline's
//! cancellation signal is raised so bounded downstream calls stop, and a 504
//! is returned. The handler task is left to wind down on its own; whatever it
//! produces afterwards is discarded.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};
use taskhub_api::ApiError;
use taskhub_core::Deadline;
use tracing::Instrument;

use crate::metrics;

pub async fn request_timeout(
    State(timeout): State<Duration>,
    mut request: Request,
    next: Next,
) -> Response {
    let deadline = Deadline::after(timeout);
    request.extensions_mut().insert(deadline.clone());

    let mut handler = tokio::spawn(next.run(request).in_current_span());

    tokio::select! {
        biased;
        joined = &mut handler => match joined {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "request handler task failed");
                ApiError::internal(format!("handler task failed: {e}")).into_response()
            }
        },
        _ = deadline.expired() => {
            deadline.cancel();
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "request deadline exceeded");
            metrics::record_request_timeout();
            ApiError::gateway_timeout("request timed out").into_response()
        }
    }
}

/// The deadline installed by [`request_timeout`], or an unbounded one when
/// the guard is not in the stack.
#[derive(Debug, Clone)]
pub struct RequestDeadline(pub Deadline);

impl<S> FromRequestParts<S> for RequestDeadline
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<Deadline>()
                .cloned()
                .unwrap_or_default(),
        ))
    }
}
