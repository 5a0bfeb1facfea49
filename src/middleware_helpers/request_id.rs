use crate::tracing::RequestId;
use axum::{
    extract::Request,
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

/// Header name for the request ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_INBOUND_ID_LEN: usize = 128;

/// Attaches an `x-request-id` to the request, its extensions, the task-local
/// scope used by error bodies, and the response.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    // Inbound ids are reused only when they are short, printable header values.
    let (request_id, header_value) = match request
        .headers()
        .get(REQUEST_ID_HEADER)
        .filter(|v| v.len() <= MAX_INBOUND_ID_LEN)
        .and_then(|v| v.to_str().ok().map(|s| (RequestId::new(s), v.clone())))
    {
        Some(pair) => pair,
        None => {
            let id = RequestId::default();
            match HeaderValue::from_str(id.as_str()) {
                Ok(value) => (id, value),
                Err(_) => return next.run(request).await,
            }
        }
    };

    request.headers_mut().insert(
        HeaderName::from_static(REQUEST_ID_HEADER),
        header_value.clone(),
    );
    request.extensions_mut().insert(request_id.clone());

    let span = tracing::info_span!(
        "request",
        request_id = %request_id.as_str(),
        method = %request.method(),
        uri = %request.uri(),
    );

    let mut response = crate::tracing::scope_request_id(
        request_id,
        async move { next.run(request).await }.instrument(span),
    )
    .await;

    response
        .headers_mut()
        .insert(HeaderName::from_static(REQUEST_ID_HEADER), header_value);

    response
}
