//! HTTP client for the execution broker.

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{direct::NotKeyed, InMemoryState};
use governor::{Quota, RateLimiter};
use helmsman_core::{
    Broker, BrokerBalance, BrokerConfig, BrokerError, BrokerTrade, ForceEnterRequest,
};
use nonzero_ext::nonzero;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

pub struct HttpBroker {
    cfg: BrokerConfig,
    http: reqwest::Client,
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

#[derive(Debug, Deserialize)]
struct ForceEnterResponse {
    trade_id: i64,
}

impl HttpBroker {
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(cfg: BrokerConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            cfg,
            http,
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(nonzero!(5u32)))),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.cfg.base_url.trim_end_matches('/'))
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, BrokerError> {
        self.rate_limiter.until_ready().await;
        let response = self
            .http
            .post(self.url(path))
            .basic_auth(&self.cfg.username, Some(&self.cfg.password))
            .json(body)
            .send()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, BrokerError> {
        self.rate_limiter.until_ready().await;
        let response = self
            .http
            .get(self.url(path))
            .basic_auth(&self.cfg.username, Some(&self.cfg.password))
            .send()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn force_enter(&self, req: &ForceEnterRequest) -> Result<i64, BrokerError> {
        let body = serde_json::to_value(req).map_err(|e| BrokerError::Transport(e.to_string()))?;
        let value = self.post_json("/forceenter", &body).await?;
        let response: ForceEnterResponse =
            serde_json::from_value(value).map_err(|e| BrokerError::Transport(e.to_string()))?;
        tracing::info!(trade_id = response.trade_id, pair = %req.pair, "force enter accepted");
        Ok(response.trade_id)
    }

    async fn force_exit(&self, trade_id: i64, amount: Option<f64>) -> Result<(), BrokerError> {
        let mut body = serde_json::json!({ "trade_id": trade_id });
        if let Some(amount) = amount {
            body["amount"] = serde_json::json!(amount);
        }
        self.post_json("/forceexit", &body).await?;
        tracing::info!(trade_id, ?amount, "force exit accepted");
        Ok(())
    }

    async fn list_trades(&self) -> Result<Vec<BrokerTrade>, BrokerError> {
        let value = self.get_json("/trades").await?;
        serde_json::from_value(value).map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn get_trade(&self, trade_id: i64) -> Result<BrokerTrade, BrokerError> {
        let value = self.get_json(&format!("/trades/{trade_id}")).await?;
        serde_json::from_value(value).map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn get_balance(&self) -> Result<BrokerBalance, BrokerError> {
        let value = self.get_json("/balance").await?;
        serde_json::from_value(value).map_err(|e| BrokerError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_join_without_double_slashes() {
        let broker = HttpBroker::new(BrokerConfig {
            base_url: "http://127.0.0.1:8080/".to_string(),
            username: "bot".to_string(),
            password: "secret".to_string(),
            timeout_secs: 60,
        })
        .unwrap();
        assert_eq!(broker.url("/forceexit"), "http://127.0.0.1:8080/forceexit");
    }

    #[test]
    fn force_enter_response_decodes() {
        let response: ForceEnterResponse =
            serde_json::from_str(r#"{"trade_id": 42, "status": "ok"}"#).unwrap();
        assert_eq!(response.trade_id, 42);
    }
}
