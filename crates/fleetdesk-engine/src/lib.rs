pub mod correlator;
pub mod engine;
pub mod error;
pub mod feed;
mod monitor;
pub mod registry;
pub mod session_log;

pub use correlator::{CommandCorrelator, CommandOutcome};
pub use engine::{DisplayEvent, Engine, EngineConfig};
pub use error::EngineError;
pub use feed::FeedConfig;
pub use registry::{AgentChange, Applied, FleetRegistry, FleetSnapshot};
pub use session_log::{SessionLog, SessionLogHandle, DEFAULT_LOG_CAPACITY};
