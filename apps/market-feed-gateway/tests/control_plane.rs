//! Control plane REST endpoints driven through the router.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::Utc;
use common::{MockConnector, ServerHandle, feed_config};
use market_feed_gateway::{
    ControlPlaneState, Gateway, GatewaySettings, MarketRecord, RecordKind, Symbol, init_metrics,
    router,
};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use test_case::test_case;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct Harness {
    state: Arc<ControlPlaneState>,
    connector: Arc<MockConnector>,
    _servers: mpsc::UnboundedReceiver<ServerHandle>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(feed_config())
    }

    fn with_config(config: market_feed_gateway::FeedClientConfig) -> Self {
        let (connector, servers) = MockConnector::new(vec![]);
        let gateway = Gateway::new(
            config,
            GatewaySettings::default(),
            Arc::<MockConnector>::clone(&connector),
            CancellationToken::new(),
        );
        Self {
            state: Arc::new(ControlPlaneState::new(Arc::new(gateway), "test")),
            connector,
            _servers: servers,
        }
    }

    fn gateway(&self) -> &Gateway {
        &self.state.gateway
    }

    async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(Arc::clone(&self.state)).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.call(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn post(&self, uri: &str, body: &Value) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.call(request).await
    }
}

fn record(symbol: &str, price: i64) -> Arc<MarketRecord> {
    Arc::new(
        MarketRecord::new(Symbol::parse(symbol).unwrap(), RecordKind::Trade, Utc::now())
            .with_last(Decimal::new(price, 2), Decimal::from(100)),
    )
}

// =============================================================================
// Subscribe / Unsubscribe
// =============================================================================

#[tokio::test]
async fn subscribe_connects_and_subscribes() {
    let harness = Harness::new();

    let (status, body) = harness
        .post("/subscribe", &json!({"symbols": ["aapl", "msft", "AAPL"]}))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["symbols"], json!(["AAPL", "MSFT"]));
    assert_eq!(body["subscribedSymbols"], json!(["AAPL", "MSFT"]));
    assert_eq!(harness.connector.attempt_count(), 1);
    assert!(harness.gateway().feed().is_running());

    harness.gateway().shutdown().await;
}

#[test_case(0; "empty")]
#[test_case(51; "over the limit")]
#[tokio::test]
async fn subscribe_rejects_bad_counts(count: usize) {
    let harness = Harness::new();
    let symbols: Vec<String> = (0..count).map(|i| format!("SYM{i}")).collect();

    let (status, body) = harness.post("/subscribe", &json!({"symbols": symbols})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "BAD_REQUEST");
    assert!(harness.gateway().feed().subscribed_symbols().is_empty());
    assert_eq!(harness.connector.attempt_count(), 0);
}

#[tokio::test]
async fn subscribe_without_key_is_unavailable() {
    let mut config = feed_config();
    config.credentials = None;
    let harness = Harness::with_config(config);

    let (status, body) = harness.post("/subscribe", &json!({"symbols": ["AAPL"]})).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "SERVICE_UNAVAILABLE");
    assert_eq!(harness.connector.attempt_count(), 0);
}

#[tokio::test]
async fn unsubscribe_requires_connection() {
    let harness = Harness::new();

    let (status, body) = harness
        .post("/unsubscribe", &json!({"symbols": ["AAPL"]}))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn unsubscribe_after_subscribe() {
    let harness = Harness::new();
    let (status, _) = harness
        .post("/subscribe", &json!({"symbols": ["AAPL", "MSFT"]}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = harness.post("/unsubscribe", &json!({"symbols": []})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = harness
        .post("/unsubscribe", &json!({"symbols": ["msft"]}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subscribedSymbols"], json!(["AAPL"]));

    harness.gateway().shutdown().await;
}

// =============================================================================
// Cache
// =============================================================================

#[tokio::test]
async fn unknown_symbol_is_not_found() {
    let harness = Harness::new();

    let (status, body) = harness.get("/cache/UNKNOWN").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn cached_symbol_is_returned() {
    let harness = Harness::new();
    harness.gateway().cache().put(record("AAPL", 18525));

    let (status, body) = harness.get("/cache/aapl").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["symbol"], "AAPL");
    assert_eq!(body["data_type"], "T");
    assert_eq!(body["last_price"], json!(185.25));
    assert_eq!(body["bid_price"], Value::Null);
}

#[tokio::test]
async fn cache_listing_is_sorted_and_limited() {
    let harness = Harness::new();
    for (symbol, price) in [("MSFT", 41010), ("AAPL", 18525), ("GOOG", 15000)] {
        harness.gateway().cache().put(record(symbol, price));
    }

    let (status, body) = harness.get("/cache?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["total"], 3);
    assert_eq!(body["entries"][0]["symbol"], "AAPL");
    assert_eq!(body["entries"][1]["symbol"], "GOOG");

    let (_, body) = harness.get("/cache").await;
    assert_eq!(body["count"], 3);
}

// =============================================================================
// Health / Status / Metrics
// =============================================================================

#[tokio::test]
async fn status_reports_gateway_state() {
    let harness = Harness::new();
    harness.gateway().cache().put(record("AAPL", 100));
    let (_session, _rx) = harness.gateway().open_session();

    let (status, body) = harness.get("/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["upstreamConnected"], false);
    assert_eq!(body["running"], false);
    assert_eq!(body["connectionState"], "disconnected");
    assert_eq!(body["reconnectAttempts"], 0);
    assert_eq!(body["messagesReceived"], 0);
    assert_eq!(body["subscribedSymbols"], json!([]));
    assert_eq!(body["activeSessionCount"], 1);
    assert_eq!(body["cachedSymbolCount"], 1);
}

#[tokio::test]
async fn health_and_probes() {
    let harness = Harness::new();

    let (status, body) = harness.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["upstreamConnected"], false);
    assert_eq!(body["running"], false);

    let (status, _) = harness.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = harness.get("/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    harness.gateway().ensure_upstream().await.unwrap();
    let (status, _) = harness.get("/readyz").await;
    assert_eq!(status, StatusCode::OK);

    harness.gateway().shutdown().await;
}

#[tokio::test]
async fn metrics_are_rendered_as_text() {
    let _ = init_metrics();
    let harness = Harness::new();

    let response = router(Arc::clone(&harness.state))
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}
