pub mod controller;
pub mod locks;
pub mod triggers;

pub use controller::ExitController;
pub use locks::PositionLocks;
pub use triggers::{evaluate, stop_loss_hit, target_hit, ExitPlan};
