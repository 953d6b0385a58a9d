//! Node services for a decentralized live-video transcoding network:
//! configuration, errors, logging, the on-chain job driver, orchestrator
//! discovery, telemetry, object storage drivers and the media session
//! coordinator.

pub mod census;
pub mod chain;
pub mod config;
pub mod discovery;
pub mod drivers;
pub mod error;
pub mod logging;
pub mod node;
pub mod profiles;
pub mod session;

pub use census::Census;
pub use config::Config;
pub use error::{Error, Result};
pub use node::Node;
pub use session::{SessionConfig, SessionCoordinator, SessionState};
