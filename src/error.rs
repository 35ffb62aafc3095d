use std::sync::Arc;

/// Error returned by the bulk-fetch function, shared by every waiter of the
/// failed batch.
pub type FetchError = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The caller's cancellation token fired before the batch resolved.
    #[error("lookup cancelled")]
    Cancelled,

    /// The bulk fetch returned fewer results than it was given keys, and this
    /// key's position was past the end of the result sequence.
    #[error("bulk fetch returned no result for this key")]
    MissingResult,

    /// The batch went away without writing a result. Only reachable if the
    /// fetch future panicked or the runtime shut down mid-batch.
    #[error("batch dropped before resolving")]
    BatchDropped,

    #[error(transparent)]
    Fetch(FetchError),
}
