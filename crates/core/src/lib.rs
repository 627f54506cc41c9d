pub mod amount;
pub mod config;
pub mod config_loader;
pub mod error;
pub mod events;
pub mod position;
pub mod traits;
pub mod webhook;

pub use config::{
    AppConfig, BrokerConfig, DatabaseConfig, ExitConfig, IndicatorConfig, MonitorConfig,
    ServerConfig, VenueConfig,
};
pub use config_loader::ConfigLoader;
pub use error::{BrokerError, SourceError};
pub use events::{
    Candle, CandleEvent, ConnectHook, DisconnectHook, PriceQuote, SourceStats, SubscribeOptions,
    TradeTick,
};
pub use position::{
    ExitKind, OperationKind, PendingExit, PendingExitState, Position, PositionStatus,
    PositionWithTiers, Side, Tier, TierName, TierRecord,
};
pub use traits::{
    Broker, BrokerBalance, BrokerTrade, ForceEnterRequest, MarketSource, Notifier, NullNotifier,
    PositionStore, TierModification, TradeOperation,
};
pub use webhook::{WebhookMessage, WEBHOOK_ENTRY_FILL, WEBHOOK_EXIT_FILL};
