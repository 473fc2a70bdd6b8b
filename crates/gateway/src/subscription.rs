//! Cancellable auth-change subscriptions.

use std::future::Future;

use futures::StreamExt;
use shared::protocol::AuthChange;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

use crate::AuthGateway;

/// Handle to a registered auth-change handler.
///
/// The handler task stops when the handle is released, either through
/// [`Subscription::unsubscribe`] or by dropping it. Both paths release once.
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Runs `handler` for every change delivered on `receiver`, one at a
    /// time and in delivery order.
    pub fn spawn<F, Fut>(receiver: broadcast::Receiver<AuthChange>, mut handler: F) -> Self
    where
        F: FnMut(AuthChange) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut changes = BroadcastStream::new(receiver);
            while let Some(item) = changes.next().await {
                match item {
                    Ok(change) => {
                        debug!(seq = change.seq, event = ?change.event, "auth change delivered");
                        handler(change).await;
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "auth change subscriber lagged; older events dropped");
                    }
                }
            }
        });
        Self { task: Some(task) }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Registers `handler` against the gateway's auth-change stream.
pub fn on_auth_state_change<G, F, Fut>(gateway: &G, handler: F) -> Subscription
where
    G: AuthGateway + ?Sized,
    F: FnMut(AuthChange) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Subscription::spawn(gateway.subscribe_auth_changes(), handler)
}
