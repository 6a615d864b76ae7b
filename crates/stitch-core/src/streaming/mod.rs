/// Push-callback to pull-stream bridge
pub mod bridge;

/// Streamed model calls
pub mod model;
