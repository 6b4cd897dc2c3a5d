//! Tracks whether each watch has completed its initial list.

use futures::prelude::*;
use kube::runtime::watcher;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Completes once every registered watch has delivered its initial state.
#[derive(Debug, Default)]
pub(crate) struct Primed {
    pending: Vec<(&'static str, oneshot::Receiver<()>)>,
}

impl Primed {
    /// Wraps a watch so that it is tracked by this barrier.
    pub(crate) fn watch<T>(
        &mut self,
        name: &'static str,
        events: impl Stream<Item = watcher::Event<T>> + Send + 'static,
    ) -> impl Stream<Item = watcher::Event<T>> + Send + 'static
    where
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pending.push((name, rx));
        let mut tx = Some(tx);
        events.inspect(move |event| {
            if let watcher::Event::InitDone = event {
                if let Some(tx) = tx.take() {
                    debug!(watch = name, "Initial list complete");
                    let _ = tx.send(());
                }
            }
        })
    }

    /// Waits for all watches to be primed. Returns false if a watch ended
    /// before it was primed.
    pub(crate) async fn wait(self) -> bool {
        for (name, rx) in self.pending {
            if rx.await.is_err() {
                debug!(watch = name, "Watch ended before its initial list completed");
                return false;
            }
        }
        info!("Caches primed");
        true
    }
}
