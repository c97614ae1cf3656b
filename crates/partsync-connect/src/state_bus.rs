//! Connection-state notification plumbing.
//!
//! Transports report connection changes asynchronously, outside any
//! reconcile cycle.  [`StateBus`] is the broadcast side a [`MachineClient`]
//! implementation publishes on; [`StateSubscription`] is the registry side
//! that forwards every event into the status map until it is dropped.
//!
//! [`MachineClient`]: crate::client::MachineClient

use partsync_types::{ConnectionEvent, ConnectionState};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Number of buffered events before slow subscribers start lagging.
const DEFAULT_CAPACITY: usize = 32;

/// Broadcast channel of [`ConnectionEvent`]s for one client.
///
/// Clone it cheaply – all clones share the same underlying channel.
#[derive(Clone, Debug)]
pub struct StateBus {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl StateBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a state change.
    ///
    /// Returns the number of subscribers that were handed the event; `0` when
    /// nobody is listening, which is normal before the registry subscribes.
    pub fn publish(&self, state: ConnectionState) -> usize {
        self.sender.send(ConnectionEvent::new(state)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StateBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Forwards events from a client's state channel to a handler.
///
/// Dropping the subscription unsubscribes: the forwarding task is aborted and
/// the receiver released.
pub struct StateSubscription {
    task: JoinHandle<()>,
}

impl StateSubscription {
    /// Spawn a forwarding task on the current Tokio runtime.
    pub fn spawn<F>(label: String, mut receiver: broadcast::Receiver<ConnectionEvent>, on_event: F) -> Self
    where
        F: Fn(ConnectionState) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        debug!(part = %label, state = %event.state, "transport reported state change");
                        on_event(event.state);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(part = %label, lagged_by = n, "connection state subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self { task }
    }
}

impl Drop for StateSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = StateBus::default();
        assert_eq!(bus.publish(ConnectionState::Connected), 0);
    }

    #[tokio::test]
    async fn every_subscriber_receives_the_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = StateBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.publish(ConnectionState::Disconnected), 2);
        assert_eq!(rx1.recv().await?.state, ConnectionState::Disconnected);
        assert_eq!(rx2.recv().await?.state, ConnectionState::Disconnected);
        Ok(())
    }

    #[tokio::test]
    async fn subscription_forwards_until_dropped() {
        let bus = StateBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = StateSubscription::spawn("part-a".to_string(), bus.subscribe(), move |state| {
            sink.lock().unwrap().push(state);
        });

        bus.publish(ConnectionState::Disconnected);
        bus.publish(ConnectionState::Connected);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectionState::Disconnected, ConnectionState::Connected]
        );

        drop(sub);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(bus.subscriber_count(), 0, "dropping must release the receiver");
        bus.publish(ConnectionState::Disconnected);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
