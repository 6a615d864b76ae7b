/// Operation aggregate, step records and suspensions
pub mod operation;

/// Domain events
pub mod events;

/// Operation store interface
pub mod store;
