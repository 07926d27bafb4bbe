//! RPC handlers

pub mod admin;
pub mod dispute;
pub mod escrow;
pub mod health;

use axum::{
    http::HeaderValue,
    response::{IntoResponse, Response},
    Json,
};
use covenant_idempotency::Executed;
use serde::Serialize;

/// Set on responses served from the idempotency ledger
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

/// Serialize an idempotent result, flagging replays in a header
pub(crate) fn settled<T: Serialize>(executed: Executed<T>) -> Response {
    let replayed = executed.is_replay();
    let mut response = Json(executed).into_response();
    if replayed {
        response
            .headers_mut()
            .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    }
    response
}
