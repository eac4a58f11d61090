pub mod async_tracker;
pub mod breaker;
pub mod cancellation;
pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod event_ring;
pub mod frame_stats;
pub mod retry;
pub mod scope_lock;

pub use async_tracker::*;
pub use breaker::*;
pub use cancellation::*;
pub use clock::*;
pub use config::*;
pub use error::*;
pub use event_bus::*;
pub use event_ring::*;
pub use frame_stats::*;
pub use retry::*;
pub use scope_lock::*;
