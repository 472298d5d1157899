//! Dispatch of matching requests to the tunnel server
//!
//! An axum middleware sits in front of the rest of the router. Requests
//! picked by the [`RequestMatcher`] are answered by the [`TunnelServer`];
//! everything else passes through untouched.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use polltunnel_shared::protocol::{PAYLOAD_CONTENT_TYPE, SEQ_HEADER};
use polltunnel_shared::Error;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::matcher::RequestMatcher;
use crate::server::{TunnelReply, TunnelServer};

/// Max accepted size of a tunnel request body (1 MB)
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

#[derive(Clone)]
pub struct TunnelFilter {
    matcher: Arc<dyn RequestMatcher>,
    server: Arc<TunnelServer>,
}

impl TunnelFilter {
    pub fn new(matcher: Arc<dyn RequestMatcher>, server: Arc<TunnelServer>) -> Self {
        Self { matcher, server }
    }

    pub fn server(&self) -> &Arc<TunnelServer> {
        &self.server
    }
}

/// Middleware entry point
pub async fn tunnel_filter(
    State(filter): State<TunnelFilter>,
    request: Request,
    next: Next,
) -> Response {
    if !filter.matcher.matches(request.uri().path(), request.headers()) {
        return next.run(request).await;
    }

    if request.method() != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, "Tunnel requests must use POST").into_response();
    }

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(b) => b,
        Err(e) => {
            debug!("Unable to read tunnel request body: {}", e);
            return (StatusCode::BAD_REQUEST, "Unreadable request body").into_response();
        }
    };

    match filter.server.handle(&parts.headers, body).await {
        Ok(reply) => reply.into_response(),
        Err(e @ (Error::MissingSequence | Error::InvalidSequence(_))) => {
            debug!("Rejected tunnel request: {}", e);
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(e) => {
            warn!("Tunnel request failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Tunnel error").into_response()
        }
    }
}

impl IntoResponse for TunnelReply {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            TunnelReply::Data(payload) => {
                let mut response = Response::new(Body::from(payload.data().clone()));
                *response.status_mut() = status;
                let headers = response.headers_mut();
                headers.insert(SEQ_HEADER, HeaderValue::from(payload.sequence()));
                headers.insert(
                    axum::http::header::CONTENT_TYPE,
                    HeaderValue::from_static(PAYLOAD_CONTENT_TYPE),
                );
                response
            }
            TunnelReply::PollAgain | TunnelReply::Gone => status.into_response(),
        }
    }
}
