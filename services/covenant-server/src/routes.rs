//! Route definitions

use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{HeaderName, Request},
    routing::{get, post, put},
    Router,
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::handlers::{admin, dispute, escrow, health};
use crate::state::AppState;

/// Build the full router
pub fn create_router(state: Arc<AppState>, request_timeout: Duration) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");

    Router::new()
        .nest("/v1", v1_routes())
        .route("/health", get(health::health_check))
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
            let request_id = request
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown");
            tracing::info_span!(
                "rpc",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id,
            )
        }))
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
}

fn v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/escrows", escrow_routes())
        .nest("/disputes", dispute_routes())
        .route("/rates", post(admin::record_rate))
        .route(
            "/overrides/:account",
            put(admin::put_override)
                .get(admin::get_override)
                .delete(admin::delete_override),
        )
        .route("/alerts", get(admin::list_alerts))
        .route("/alerts/:id/clear", post(admin::clear_alert))
        .route("/alerts/:id/confirm", post(admin::confirm_alert))
        .route("/commissions", get(admin::list_commissions))
        .route("/commissions/revenue", get(admin::revenue))
        .route("/commissions/:id/transfer", post(admin::transfer_commission))
        .route("/accounts/:account/balances/:currency", get(admin::balance))
        .route("/accounts/:account/deposits", post(admin::deposit))
}

fn escrow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(escrow::create_escrow).get(escrow::list_escrows))
        .route("/:id", get(escrow::get_escrow))
        .route("/:id/proof", post(escrow::submit_proof))
        .route("/:id/proof/verify", post(escrow::verify_proof))
        .route("/:id/proof/reject", post(escrow::reject_proof))
        .route("/:id/proof/score", post(escrow::score_proof))
        .route("/:id/release", post(escrow::release))
        .route("/:id/refund", post(escrow::refund))
        .route("/:id/partial-refund", post(escrow::partial_refund))
        .route("/:id/cancel", post(escrow::cancel))
        .route(
            "/:id/disputes",
            post(escrow::open_dispute).get(escrow::escrow_disputes),
        )
        .route("/:id/commission", get(escrow::escrow_commission))
}

fn dispute_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(dispute::open_disputes))
        .route("/:id", get(dispute::get_dispute))
        .route("/:id/review", post(dispute::begin_review))
        .route("/:id/request-response", post(dispute::request_response))
        .route("/:id/respond", post(dispute::respond))
        .route("/:id/evidence", post(dispute::add_evidence))
        .route("/:id/resolve", post(dispute::resolve))
        .route("/:id/cancel", post(dispute::cancel))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::{to_bytes, Body};
    use axum::http::{Method, StatusCode};
    use chrono::{TimeZone, Utc};
    use covenant_types::{AccountId, ManualClock};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::config::ServerConfig;
    use crate::extractors::IDEMPOTENCY_KEY_HEADER;
    use crate::handlers::REPLAYED_HEADER;

    fn app(dev_mode: bool) -> (Router, Arc<AppState>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap());
        let state = Arc::new(
            AppState::build(&ServerConfig::default(), Arc::new(clock), dev_mode).unwrap(),
        );
        (create_router(state.clone(), Duration::from_secs(5)), state)
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        key: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Option<String>, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let replayed = response
            .headers()
            .get(REPLAYED_HEADER)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, replayed, value)
    }

    async fn funded(app: &Router, amount: &str) -> AccountId {
        let account = AccountId::new();
        let (status, _, _) = call(
            app,
            Method::POST,
            &format!("/v1/accounts/{account}/deposits"),
            None,
            Some(json!({ "amount": amount, "currency": "EUR" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        account
    }

    fn amount(value: &Value) -> Decimal {
        value.as_str().unwrap().parse().unwrap()
    }

    fn create_body(sender: &AccountId, recipient: &AccountId, amount: &str) -> Value {
        json!({
            "sender": sender,
            "recipient": recipient,
            "amount": amount,
            "currency": "EUR",
            "release_condition": "manual",
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app(false);
        let (status, _, body) = call(&app, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_mutation_requires_idempotency_key() {
        let (app, _) = app(true);
        let sender = funded(&app, "5000").await;
        let recipient = AccountId::new();

        let (status, _, body) = call(
            &app,
            Method::POST,
            "/v1/escrows",
            None,
            Some(create_body(&sender, &recipient, "1000")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MISSING_IDEMPOTENCY_KEY");
    }

    #[tokio::test]
    async fn test_create_release_and_replay() {
        let (app, _) = app(true);
        let sender = funded(&app, "5000").await;
        let recipient = AccountId::new();

        let (status, replayed, created) = call(
            &app,
            Method::POST,
            "/v1/escrows",
            Some("booking-7781"),
            Some(create_body(&sender, &recipient, "1000")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(replayed.is_none());
        assert_eq!(created["disposition"], "executed");
        assert_eq!(created["value"]["status"], "held");
        let id = created["value"]["id"].as_str().unwrap().to_string();

        let release = format!("/v1/escrows/{id}/release");
        let body = json!({ "released_by": sender });
        let (status, _, first) =
            call(&app, Method::POST, &release, Some("release-1"), Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["value"]["status"], "released");

        let (status, replayed, second) =
            call(&app, Method::POST, &release, Some("release-1"), Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(replayed.as_deref(), Some("true"));
        assert_eq!(second["value"], first["value"]);

        let (_, _, balance) = call(
            &app,
            Method::GET,
            &format!("/v1/accounts/{recipient}/balances/EUR"),
            None,
            None,
        )
        .await;
        assert_eq!(amount(&balance["balance"]), dec!(960));
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let (app, _) = app(true);
        let sender = funded(&app, "5000").await;
        let recipient = AccountId::new();

        let (status, _, body) = call(
            &app,
            Method::GET,
            &format!("/v1/escrows/{}", covenant_types::EscrowId::new()),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");

        let (_, _, created) = call(
            &app,
            Method::POST,
            "/v1/escrows",
            Some("create-1"),
            Some(create_body(&sender, &recipient, "200")),
        )
        .await;
        let id = created["value"]["id"].as_str().unwrap().to_string();

        // Only the sender may release
        let (status, _, body) = call(
            &app,
            Method::POST,
            &format!("/v1/escrows/{id}/release"),
            Some("release-1"),
            Some(json!({ "released_by": recipient })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "UNAUTHORIZED");

        let (status, _, _) = call(
            &app,
            Method::POST,
            &format!("/v1/escrows/{id}/refund"),
            Some("refund-1"),
            Some(json!({ "reason": "guest cancelled" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = call(
            &app,
            Method::POST,
            &format!("/v1/escrows/{id}/release"),
            Some("release-2"),
            Some(json!({ "released_by": sender })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_dispute_flow_over_rpc() {
        let (app, _) = app(true);
        let sender = funded(&app, "5000").await;
        let recipient = AccountId::new();
        let adjudicator = AccountId::new();

        let (_, _, created) = call(
            &app,
            Method::POST,
            "/v1/escrows",
            Some("create-1"),
            Some(create_body(&sender, &recipient, "1000")),
        )
        .await;
        let id = created["value"]["id"].as_str().unwrap().to_string();

        let (status, _, opened) = call(
            &app,
            Method::POST,
            &format!("/v1/escrows/{id}/disputes"),
            Some("dispute-1"),
            Some(json!({
                "raised_by": sender,
                "reason": "not_delivered",
                "description": "host never handed over the keys",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let dispute_id = opened["value"]["id"].as_str().unwrap().to_string();

        let (_, _, open) = call(&app, Method::GET, "/v1/disputes", None, None).await;
        assert_eq!(open.as_array().unwrap().len(), 1);

        let (status, _, resolved) = call(
            &app,
            Method::POST,
            &format!("/v1/disputes/{dispute_id}/resolve"),
            Some("resolve-1"),
            Some(json!({ "adjudicator": adjudicator, "resolution": "refund" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resolved["value"]["escrow"]["status"], "refunded");

        let (_, _, balance) = call(
            &app,
            Method::GET,
            &format!("/v1/accounts/{sender}/balances/EUR"),
            None,
            None,
        )
        .await;
        assert_eq!(amount(&balance["balance"]), dec!(5000));
    }

    #[tokio::test]
    async fn test_deposits_disabled_outside_dev_mode() {
        let (app, _) = app(false);
        let (status, _, body) = call(
            &app,
            Method::POST,
            &format!("/v1/accounts/{}/deposits", AccountId::new()),
            None,
            Some(json!({ "amount": "100", "currency": "EUR" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "DISABLED");
    }

    #[tokio::test]
    async fn test_rate_feed_enables_cross_currency_escrow() {
        let (app, state) = app(true);
        let sender = funded(&app, "5000").await;
        let recipient = AccountId::new();

        let (status, _, _) = call(
            &app,
            Method::POST,
            "/v1/rates",
            None,
            Some(json!({
                "base": "EUR",
                "target": "TRY",
                "mid": "35",
                "bid": "35",
                "ask": "35",
                "as_of": state.manager.now(),
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let mut body = create_body(&sender, &recipient, "1000");
        body["settlement_currency"] = json!("TRY");
        let (status, _, created) =
            call(&app, Method::POST, "/v1/escrows", Some("create-try"), Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["value"]["settlement_currency"], "TRY");
        assert_eq!(amount(&created["value"]["settlement_amount"]), dec!(33600));
    }
}
