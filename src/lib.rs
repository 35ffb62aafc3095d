//! Coalesce concurrent point lookups into one bulk fetch per time window.
//!
//! The first key to arrive opens a batch and arms a window timer; every lookup
//! issued before the timer elapses joins that batch. When the window closes
//! the batch is handed to a user supplied bulk-fetch function in a single
//! call, and results are routed back to callers by position: the i-th key
//! registered in the window receives the i-th result. A fetch error is shared
//! by every caller in the batch.
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! let batcher = batcher::Batcher::new(Duration::from_millis(5), |keys: Vec<u32>| async move {
//!     // one call, no matter how many concurrent lookups
//!     Ok::<_, std::io::Error>(keys.iter().map(|key| key * 2).collect())
//! });
//!
//! let value = batcher.get(&CancellationToken::new(), 21).await.unwrap();
//! assert_eq!(value, 42);
//! # }
//! ```

mod error;


use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub use error::{Error, FetchError};

type FetchFuture<V> = Pin<Box<dyn Future<Output = Result<Vec<V>, FetchError>> + Send>>;

/// One coalesced group of keys collected within a single window and resolved
/// by one fetch call. Keys and waiters are index-aligned.
struct Batch<K, V> {
    keys: Vec<K>,
    waiters: Vec<oneshot::Sender<Result<V, Error>>>,
}

struct Shared<K, V> {
    window: Duration,
    fetch: Box<dyn Fn(Vec<K>) -> FetchFuture<V> + Send + Sync>,

    /// The open batch, if any. Locked for bookkeeping only, never held
    /// across an await.
    current: Mutex<Option<Batch<K, V>>>,
}

impl<K, V> Shared<K, V> {
    /// Runs once per batch, when its window timer elapses.
    async fn fire(&self) {
        // Seal and detach the batch so lookups arriving from now on open a
        // fresh window instead of queueing behind this fetch.
        let batch = self.current.lock().expect("lock current batch").take();
        let Some(Batch { keys, waiters }) = batch else {
            return;
        };

        let wanted = waiters.len();
        debug!(message = "batch window elapsed, fetching", keys = wanted);

        match (self.fetch)(keys).await {
            Ok(results) => {
                if results.len() != wanted {
                    warn!(
                        message = "bulk fetch broke the length contract",
                        keys = wanted,
                        results = results.len()
                    );
                }

                let mut results = results.into_iter();
                for tx in waiters {
                    let outcome = match results.next() {
                        Some(value) => Ok(value),
                        None => Err(Error::MissingResult),
                    };

                    // the waiter may have been cancelled and gone away
                    let _ = tx.send(outcome);
                }
            }
            Err(err) => {
                for tx in waiters {
                    let _ = tx.send(Err(Error::Fetch(Arc::clone(&err))));
                }
            }
        }
    }
}

/// Coalesces concurrent lookups into one bulk fetch per time window.
///
/// Cloning is cheap, and every clone feeds the same batches.
pub struct Batcher<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for Batcher<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> Batcher<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    /// `fetch` receives the ordered keys of one window and must return one
    /// result per key, in the same order, or a single error for the whole
    /// batch. It runs outside any lock, one invocation per batch; a slow call
    /// overlaps with later windows rather than delaying them.
    ///
    /// # Panics
    ///
    /// Panics if `window` is zero.
    pub fn new<F, Fut, E>(window: Duration, fetch: F) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<V>, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        assert!(!window.is_zero(), "window must be a positive duration");

        let fetch = Box::new(move |keys: Vec<K>| -> FetchFuture<V> {
            let fut = fetch(keys);
            Box::pin(async move { fut.await.map_err(|err| Arc::new(err) as FetchError) })
        });

        Self {
            shared: Arc::new(Shared {
                window,
                fetch,
                current: Mutex::new(None),
            }),
        }
    }

    /// Register `key` into the open batch, opening a new one if none exists,
    /// and wait for the batched result.
    ///
    /// A `ctx` that is already cancelled fails immediately without touching
    /// the batcher. Cancelling mid-wait unblocks this caller only: the key
    /// stays in the batch, the fetch still runs, and the other waiters are
    /// unaffected.
    pub async fn get(&self, ctx: &CancellationToken, key: K) -> Result<V, Error> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let rx = {
            let mut current = self.shared.current.lock().expect("lock current batch");

            let batch = current.get_or_insert_with(|| {
                debug!(message = "opening batch", window = ?self.shared.window);

                // The timer is armed once, on the first key, and is never
                // reset by later arrivals. Only this task detaches the batch,
                // so the one it takes is the one that armed it.
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move {
                    tokio::time::sleep(shared.window).await;
                    shared.fire().await;
                });

                Batch {
                    keys: Vec::new(),
                    waiters: Vec::new(),
                }
            });

            let (tx, rx) = oneshot::channel();
            batch.keys.push(key);
            batch.waiters.push(tx);

            trace!(message = "waiter registered", index = batch.waiters.len() - 1);

            rx
        };

        tokio::select! {
            // if the batch resolved and the token fired at the same time,
            // prefer the result the fetch already produced
            biased;

            resolved = rx => match resolved {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::BatchDropped),
            },
            () = ctx.cancelled() => Err(Error::Cancelled),
        }
    }
}
