use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Fan-out of change notifications to subscriber callbacks.
///
/// Every subscriber gets its own queue and delivery task: handlers run
/// independently of each other, and each one sees events in publish order.
pub struct EventBus<T> {
    subscribers: RwLock<Vec<mpsc::UnboundedSender<T>>>,
    runtime: Handle,
    cancel: CancellationToken,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// Must be called from within a tokio runtime. Delivery stops when `cancel` fires.
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            runtime: Handle::current(),
            cancel,
        }
    }

    pub fn subscribe<F>(&self, mut handler: F)
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let cancel = self.cancel.clone();

        self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => handler(event),
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        });

        self.subscribers.write().push(tx);
    }

    pub(crate) fn publish(&self, event: T) {
        // Snapshot so a concurrent subscribe never blocks on an in-flight delivery
        let subscribers = self.subscribers.read().clone();
        for tx in subscribers {
            let _ = tx.send(event.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
