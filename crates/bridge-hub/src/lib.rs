pub mod config;
pub mod logging;
pub mod pool;
pub mod server;
pub mod sessions;

pub use pool::{
    Connection, ConnectionPool, ConnectionSummary, PendingReply, ReplyOutcome, Transport,
};
pub use sessions::SessionTracker;
