use serde::{Deserialize, Deserializer};

/// Broker webhook payload for entry and exit fills.
///
/// The broker serializes numerics inconsistently (sometimes strings), so
/// every numeric field decodes through a tolerant helper.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, deserialize_with = "flexible_i64")]
    pub trade_id: i64,
    #[serde(default)]
    pub pair: String,
    #[serde(default)]
    pub direction: String,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub amount: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub close_rate: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub open_rate: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub stake_amount: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub leverage: f64,
    #[serde(default)]
    pub exit_reason: String,
}

pub const WEBHOOK_ENTRY_FILL: &str = "entry_fill";
pub const WEBHOOK_EXIT_FILL: &str = "exit_fill";

impl WebhookMessage {
    /// Symbol form used internally: `ETH/USDT:USDT` becomes `ETHUSDT`.
    #[must_use]
    pub fn symbol(&self) -> String {
        let base = self.pair.split(':').next().unwrap_or(&self.pair);
        base.replace('/', "").trim().to_uppercase()
    }
}

fn flexible_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Text(String),
        Null(Option<()>),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Num(v) => v,
        Raw::Text(s) => s.trim().parse().unwrap_or(0.0),
        Raw::Null(_) => 0.0,
    })
}

fn flexible_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Float(f64),
        Text(String),
        Null(Option<()>),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Num(v) => v,
        Raw::Float(v) => v as i64,
        Raw::Text(s) => s.trim().parse::<f64>().map(|f| f as i64).unwrap_or(0),
        Raw::Null(_) => 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_string_and_number_fields() {
        let text = r#"{
            "type": "exit_fill",
            "trade_id": "42",
            "pair": "ETH/USDT:USDT",
            "direction": "long",
            "amount": "0.5",
            "close_rate": 2851.0,
            "stake_amount": "1000",
            "exit_reason": "force_exit"
        }"#;
        let msg: WebhookMessage = serde_json::from_str(text).unwrap();
        assert_eq!(msg.kind, WEBHOOK_EXIT_FILL);
        assert_eq!(msg.trade_id, 42);
        assert_eq!(msg.amount, 0.5);
        assert_eq!(msg.close_rate, 2851.0);
        assert_eq!(msg.symbol(), "ETHUSDT");
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let msg: WebhookMessage = serde_json::from_str(r#"{"type":"entry_fill"}"#).unwrap();
        assert_eq!(msg.trade_id, 0);
        assert_eq!(msg.amount, 0.0);
        assert_eq!(msg.symbol(), "");
    }
}
