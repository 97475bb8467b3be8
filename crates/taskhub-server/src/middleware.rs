use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

// Ensures each request has an X-Request-Id and mirrors it on the response
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    // Preserve a usable incoming id; otherwise generate one
    let req_id_value = req
        .headers()
        .get(&REQUEST_ID_HEADER)
        .filter(|v| !v.is_empty())
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());

    let Some(req_id_value) = req_id_value else {
        return next.run(req).await;
    };

    // Available to the trace span and handlers
    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(REQUEST_ID_HEADER, req_id_value);
    res
}
