pub mod cvd;
pub mod monitor;
pub mod replay;
pub mod ring;
pub mod source;
pub mod stream;
pub mod wire;

pub use cvd::{compute_cvd, CvdMetrics};
pub use monitor::{PriceMonitor, PriceUpdate};
pub use replay::ReplaySource;
pub use ring::CandleRing;
pub use source::VenueSource;
pub use stream::CombinedStreamsClient;
