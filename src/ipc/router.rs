use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const HANDLERS: [TryHandle; 8] = [
    handlers::core::try_handle,
    handlers::students::try_handle,
    handlers::subjects::try_handle,
    handlers::exams::try_handle,
    handlers::marks::try_handle,
    handlers::library::try_handle,
    handlers::imports::try_handle,
    handlers::calc::try_handle,
];

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    for try_handle in HANDLERS {
        if let Some(resp) = try_handle(state, req) {
            return resp;
        }
    }
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    tracing::debug!(id = %req.id, method = %req.method, "request");
    let resp = dispatch(state, &req);
    if resp.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = resp
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        tracing::warn!(id = %req.id, method = %req.method, code, "request failed");
    }
    resp
}
