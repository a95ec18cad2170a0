pub mod correlator;
pub mod manager;

pub use correlator::Correlator;
pub use manager::{reconnect_backoff, should_attempt_reconnect, ConnectionManager, ConnectionState, ManagerConfig};
