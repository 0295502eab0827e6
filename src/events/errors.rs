//! Error types for observation bus operations

/// Error conditions on the fan-out path
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// No active subscribers when publishing
    #[error("no active subscribers")]
    NoSubscribers,

    /// Receiver fell behind and missed messages
    #[error("receiver lagged behind, missed {0} events")]
    Lagged(u64),
}
