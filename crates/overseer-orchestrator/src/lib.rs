pub mod error;
pub mod memory_sandbox;
pub mod orchestrator;
pub mod repository;
pub mod sink;
pub mod traits;

pub use error::*;
pub use memory_sandbox::*;
pub use orchestrator::*;
pub use repository::*;
pub use sink::*;
pub use traits::*;
