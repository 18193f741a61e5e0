pub mod batch;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod inflight;
pub mod kafka;
pub mod metrics_utils;
pub mod offsets;
pub mod pipeline;
pub mod test_utils;
pub mod transport;
