pub mod memory;
pub mod postgres;

pub use memory::MemoryPositionStore;
pub use postgres::PgPositionStore;
