use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub venue: VenueConfig,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub exits: ExitConfig,
    #[serde(default)]
    pub indicators: IndicatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Upstream derivatives venue endpoints and stream tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    pub rest_url: String,
    pub ws_url: String,
    #[serde(default = "default_batch_size")]
    pub ws_batch_size: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

/// Downstream execution broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub symbols: Vec<String>,
    pub intervals: Vec<String>,
    pub ring_capacity: usize,
    /// Trade prices older than this are not used for exit decisions.
    pub last_price_max_age_secs: u64,
    /// Candle-cache fallback is only honored up to this age.
    pub candle_fallback_max_age_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            intervals: vec!["15m".to_string(), "1h".to_string(), "4h".to_string()],
            ring_capacity: 500,
            last_price_max_age_secs: 10,
            candle_fallback_max_age_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitConfig {
    /// When true a tier/SL/TP only triggers when `last` itself crosses the
    /// level; when false (default) the bar's high/low extremes count too.
    pub tick_confirm: bool,
    /// Pending exits older than this raise an operator warning.
    pub pending_exit_warn_secs: u64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            tick_confirm: false,
            pending_exit_warn_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    /// Candle window handed to the indicator engine.
    pub window: usize,
    pub rsi_enabled: bool,
    pub ema_fast: usize,
    pub ema_mid: usize,
    pub ema_slow: usize,
    pub ema_long: usize,
    pub wt_channel_len: usize,
    pub wt_avg_len: usize,
    pub wt_smooth_len: usize,
    pub mfi_len: usize,
    pub wt_weight: f64,
    pub mfi_scale: f64,
    pub wt_overbought: f64,
    pub wt_oversold: f64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            window: 240,
            rsi_enabled: true,
            ema_fast: 21,
            ema_mid: 55,
            ema_slow: 100,
            ema_long: 200,
            wt_channel_len: 10,
            wt_avg_len: 8,
            wt_smooth_len: 5,
            mfi_len: 10,
            wt_weight: 0.3,
            mfi_scale: 1.5,
            wt_overbought: 50.0,
            wt_oversold: -50.0,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8099,
            },
            database: DatabaseConfig {
                url: "postgresql://localhost/helmsman".to_string(),
                max_connections: 10,
            },
            venue: VenueConfig {
                rest_url: "https://fapi.binance.com".to_string(),
                ws_url: "wss://fstream.binance.com/stream".to_string(),
                ws_batch_size: default_batch_size(),
                history_limit: default_history_limit(),
                http_timeout_secs: default_http_timeout(),
            },
            broker: BrokerConfig {
                base_url: "http://127.0.0.1:8080".to_string(),
                username: String::new(),
                password: String::new(),
                timeout_secs: default_http_timeout(),
            },
            monitor: MonitorConfig::default(),
            exits: ExitConfig::default(),
            indicators: IndicatorConfig::default(),
        }
    }
}

const fn default_batch_size() -> usize {
    150
}

const fn default_history_limit() -> usize {
    500
}

const fn default_http_timeout() -> u64 {
    60
}
