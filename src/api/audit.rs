//! Audit logging for every request crossing the HTTP surface.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;

use super::{ClientId, ErrorMessage};

/// Log method, URL, remote address, client id, a header snapshot
/// (Authorization stripped), the outcome status and the error string if any.
pub(crate) async fn audit_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let headers = header_snapshot(req.headers());

    let resp = next.run(req).await;

    let code = resp.status().as_u16();
    let client_id = resp
        .extensions()
        .get::<ClientId>()
        .map(|c| c.0.clone())
        .unwrap_or_default();
    let error = resp.extensions().get::<ErrorMessage>().map(|e| e.0.clone());

    match error {
        Some(error) => {
            tracing::debug!(
                method = %method,
                url = %uri,
                remote_addr = %remote_addr,
                client_id = %client_id,
                header = %headers,
                code,
                error = %error,
                status = "fail",
                "http audit"
            );
        }
        None => {
            tracing::debug!(
                method = %method,
                url = %uri,
                remote_addr = %remote_addr,
                client_id = %client_id,
                header = %headers,
                code,
                status = "success",
                "http audit"
            );
        }
    }

    resp
}

fn header_snapshot(headers: &axum::http::HeaderMap) -> String {
    let filtered: Vec<String> = headers
        .iter()
        .filter(|(name, _)| **name != AUTHORIZATION)
        .map(|(name, value)| format!("{}: {}", name, value.to_str().unwrap_or("<binary>")))
        .collect();
    filtered.join(", ")
}
