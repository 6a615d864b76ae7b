/// Flow definition trait
pub mod flow;

/// Run context, step memoization and replay
pub mod context;

/// Sleep, interrupt and sub-flow wait
pub mod suspension;

/// Bounded order-preserving fan-out
pub mod fan_out;

/// Flow engine: start, resume, status
pub mod engine;

/// Background wake-up of due operations
pub mod waker;
