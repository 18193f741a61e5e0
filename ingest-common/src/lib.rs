pub mod envelope;
pub mod fingerprint;
pub mod plugin;
pub mod registry;
pub mod retry;
