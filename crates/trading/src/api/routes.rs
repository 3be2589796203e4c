//! API routes for trading

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::api::handlers::*;
use crate::exchange::Exchange;

/// Create the trading router
pub fn create_router(state: Arc<TradingApiState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/orders", post(create_order).get(list_orders))
        .route(
            "/api/orders/:order_id",
            get(get_order).put(replace_order).delete(cancel_order),
        )
        .route("/api/trades", get(list_trades))
        .route("/api/markets/:market/depth", get(get_depth))
        .route("/api/balances", get(get_balances))
        .route("/api/withdrawals", post(request_withdrawal))
        .with_state(state)
}

/// Get the API state for the router
pub fn create_api_state(exchange: Arc<Exchange>) -> Arc<TradingApiState> {
    Arc::new(TradingApiState { exchange })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use common::AccountKey;
    use config::generate_default_config;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::exchange::Backends;

    const ALICE: AccountKey = AccountKey {
        user_id: 7,
        sub_account: 0,
    };

    async fn start() -> (Arc<Exchange>, Router) {
        let config = generate_default_config();
        let exchange = Exchange::with_backends(&config, Backends::in_memory())
            .await
            .unwrap();
        let router = create_router(create_api_state(exchange.clone()));
        (exchange, router)
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-user-id", ALICE.user_id.to_string());
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn limit_buy() -> Value {
        json!({
            "market": "btcusdt",
            "side": "buy",
            "type": "limit",
            "price": "30000.00",
            "amount": "0.5"
        })
    }

    #[tokio::test]
    async fn test_health_lists_running_markets() {
        let (exchange, router) = start().await;
        let (status, body) = call(&router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["markets"], json!(["btcusdt"]));
        exchange.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_caller_is_unauthorized() {
        let (exchange, router) = start().await;
        let request = Request::builder()
            .method("GET")
            .uri("/api/balances")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        exchange.shutdown().await;
    }

    #[tokio::test]
    async fn test_order_rejections_map_to_status_codes() {
        let (exchange, router) = start().await;

        let (status, body) = call(&router, "POST", "/api/orders", Some(limit_buy())).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["error"]["code"], "INSUFFICIENT_FUNDS");

        let mut bad = limit_buy();
        bad["price"] = json!("30000.001");
        let (status, _) = call(&router, "POST", "/api/orders", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut unknown = limit_buy();
        unknown["market"] = json!("dogeusdt");
        let (status, _) = call(&router, "POST", "/api/orders", Some(unknown)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&router, "DELETE", "/api/orders/999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        exchange.shutdown().await;
    }

    #[tokio::test]
    async fn test_place_and_cancel_round_trip() {
        let (exchange, router) = start().await;
        exchange
            .funds()
            .deposit(ALICE, "USDT", 2_000_000, "dep-1")
            .await
            .unwrap();

        let (status, order) = call(&router, "POST", "/api/orders", Some(limit_buy())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(order["status"], "pending");
        assert_eq!(order["price"], "30000.00");
        let id = order["id"].as_u64().unwrap();

        let (_, balances) = call(&router, "GET", "/api/balances", None).await;
        assert_eq!(balances["balances"]["USDT"]["locked"], 1_500_000);

        let (status, body) = call(&router, "DELETE", &format!("/api/orders/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "cancelled");

        let (_, body) = call(&router, "GET", &format!("/api/orders/{}", id), None).await;
        assert_eq!(body["status"], "cancelled");
        let (_, balances) = call(&router, "GET", "/api/balances", None).await;
        assert_eq!(balances["balances"]["USDT"]["available"], 2_000_000);
        assert_eq!(balances["balances"]["USDT"]["locked"], 0);

        let (_, listed) = call(&router, "GET", "/api/orders?status=closed", None).await;
        assert_eq!(listed["orders"].as_array().unwrap().len(), 1);
        exchange.shutdown().await;
    }
}
