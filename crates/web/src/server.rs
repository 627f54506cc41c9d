use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use helmsman_core::{ServerConfig, WebhookMessage};
use helmsman_exit::ExitController;
use helmsman_market::PriceMonitor;
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ExitController>,
    pub monitor: Option<Arc<PriceMonitor>>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    reconnects: u64,
    subscribe_errors: u64,
    dropped_frames: u64,
    last_error: Option<String>,
    pending_exits: usize,
    missing_price_symbols: usize,
}

#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/healthz", get(healthz))
        .route("/api/stats", get(stats))
        .with_state(state)
}

/// Binds the listener and serves until the task is cancelled.
///
/// # Errors
/// Returns an error if the address cannot be bound.
pub async fn serve(cfg: &ServerConfig, state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "webhook server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

/// Accepts broker fill notifications. Always answers 200 for decodable
/// payloads so the broker does not retry storms on semantic issues; the
/// controller handles unknown trades and duplicates itself.
async fn handle_webhook(
    State(state): State<AppState>,
    Json(message): Json<WebhookMessage>,
) -> StatusCode {
    tracing::debug!(kind = %message.kind, trade_id = message.trade_id, "webhook received");
    state.controller.on_webhook(&message).await;
    StatusCode::OK
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let source = state
        .monitor
        .as_ref()
        .map(|m| m.stats())
        .unwrap_or_default();
    Json(StatsResponse {
        reconnects: source.reconnects,
        subscribe_errors: source.subscribe_errors,
        dropped_frames: source.dropped_frames,
        last_error: source.last_error,
        pending_exits: state.controller.pending_count(),
        missing_price_symbols: state.controller.missing_price_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use helmsman_core::{
        Broker, BrokerBalance, BrokerError, BrokerTrade, ExitConfig, ForceEnterRequest,
        NullNotifier, PositionStore,
    };
    use helmsman_data::MemoryPositionStore;
    use tower::ServiceExt;

    struct NoopBroker;

    #[async_trait]
    impl Broker for NoopBroker {
        async fn force_enter(&self, _req: &ForceEnterRequest) -> Result<i64, BrokerError> {
            Ok(1)
        }
        async fn force_exit(&self, _trade_id: i64, _amount: Option<f64>) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn list_trades(&self) -> Result<Vec<BrokerTrade>, BrokerError> {
            Ok(Vec::new())
        }
        async fn get_trade(&self, _trade_id: i64) -> Result<BrokerTrade, BrokerError> {
            Err(BrokerError::Transport("unused".to_string()))
        }
        async fn get_balance(&self) -> Result<BrokerBalance, BrokerError> {
            Ok(BrokerBalance {
                available: 0.0,
                total: 0.0,
            })
        }
    }

    fn state() -> AppState {
        let store: Arc<dyn PositionStore> = Arc::new(MemoryPositionStore::new());
        let controller = ExitController::new(
            store,
            Arc::new(NoopBroker),
            Arc::new(NullNotifier),
            ExitConfig::default(),
        );
        AppState {
            controller,
            monitor: None,
        }
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let app = router(state());
        let response = app
            .oneshot(
                axum::http::Request::get("/healthz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_accepts_exit_fill_payloads() {
        let app = router(state());
        let body = serde_json::json!({
            "type": "exit_fill",
            "trade_id": 1,
            "pair": "ETH/USDT:USDT",
            "amount": "0.5",
            "close_rate": "2851.0"
        });
        let response = app
            .oneshot(
                axum::http::Request::post("/webhook")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn stats_reports_controller_counters() {
        let app = router(state());
        let response = app
            .oneshot(
                axum::http::Request::get("/api/stats")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
