use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
#[error("canceled while waiting for the previous operation")]
pub struct Canceled;

struct ChainSlot {
    token: u64,
    done: oneshot::Receiver<()>,
}

/// Serializes work per opaque key: each caller chains behind the previous
/// in-flight operation for the same key, while distinct keys run in
/// parallel. The map holds one pending completion signal per key and drains
/// itself once the last waiter finishes.
pub struct KeyedQueue {
    chains: Arc<Mutex<HashMap<String, ChainSlot>>>,
    next_token: AtomicU64,
}

impl KeyedQueue {
    pub fn new() -> Self {
        Self {
            chains: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(1),
        }
    }

    /// Waits for any prior operation with the same key, then runs `op`.
    /// Cancellation while waiting returns `Canceled` without executing `op`;
    /// a running `op` is responsible for honoring cancellation itself.
    pub async fn run<T, F, Fut>(&self, key: &str, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let previous = {
            let mut chains = self.chains.lock().expect("keyed queue lock");
            chains.insert(
                key.to_owned(),
                ChainSlot {
                    token,
                    done: done_rx,
                },
            )
        };

        if let Some(ChainSlot {
            done: mut prev_done,
            ..
        }) = previous
        {
            tokio::select! {
                _ = &mut prev_done => {}
                _ = cancel.cancelled() => {
                    // Our successor chained behind us, so it must still wait
                    // for the predecessor: forward that completion before
                    // bailing out.
                    let chains = Arc::clone(&self.chains);
                    let key = key.to_owned();
                    tokio::spawn(async move {
                        let _ = prev_done.await;
                        let _ = done_tx.send(());
                        release(&chains, &key, token);
                    });
                    return Err(Canceled.into());
                }
            }
        }

        if cancel.is_cancelled() {
            let _ = done_tx.send(());
            release(&self.chains, key, token);
            return Err(Canceled.into());
        }

        let result = op().await;
        let _ = done_tx.send(());
        release(&self.chains, key, token);
        result
    }

    #[cfg(test)]
    fn pending_keys(&self) -> usize {
        self.chains.lock().expect("keyed queue lock").len()
    }
}

impl Default for KeyedQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn release(chains: &Mutex<HashMap<String, ChainSlot>>, key: &str, token: u64) {
    let mut chains = chains.lock().expect("keyed queue lock");
    if chains.get(key).map(|slot| slot.token) == Some(token) {
        chains.remove(key);
    }
}
