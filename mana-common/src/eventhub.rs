//! Filtered pub/sub hub. Subscribers register a predicate; the sender
//! delivers each event to every subscription whose predicate matches and
//! prunes subscriptions whose receiver has gone away.

use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

type SubscriptionStore<E> = Arc<Mutex<Vec<(Box<dyn Fn(&E) -> bool + Send>, UnboundedSender<E>)>>>;

#[derive(Clone)]
pub struct EventSender<E: Clone> {
    subscriptions: SubscriptionStore<E>,
}

/// Returned when an event could not be delivered to any live subscription.
#[derive(Debug, PartialEq, Eq)]
pub struct NoSubscribers;

impl<E: Clone> EventSender<E> {
    pub async fn send(&self, event: E) -> Result<(), NoSubscribers> {
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.retain(|(filter, sender)| {
            if filter(&event) {
                sender.send(event.clone()).is_ok()
            } else {
                !sender.is_closed()
            }
        });
        if subscriptions.is_empty() {
            Err(NoSubscribers)
        } else {
            Ok(())
        }
    }
}

pub struct EventSubscription<E>(UnboundedReceiver<E>);

impl<E> EventSubscription<E> {
    pub async fn recv(&mut self) -> Option<E> {
        self.0.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.0.try_recv().ok()
    }
}

pub struct EventHub<E: Clone + Send> {
    subscriptions: SubscriptionStore<E>,
}

impl<E: Clone + Send> EventHub<E> {
    pub fn setup() -> (Self, EventSender<E>) {
        let subscriptions = Arc::new(Mutex::new(vec![]));
        (
            Self {
                subscriptions: subscriptions.clone(),
            },
            EventSender { subscriptions },
        )
    }

    pub async fn subscribe<F: Fn(&E) -> bool + Send + 'static>(
        &mut self,
        filter: F,
    ) -> EventSubscription<E> {
        let (sender, receiver) = unbounded_channel();
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.push((Box::new(filter), sender));
        EventSubscription(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_matching_subscription() {
        let (mut hub, sender) = EventHub::<u32>::setup();
        let mut evens = hub.subscribe(|e| e % 2 == 0).await;
        let mut all = hub.subscribe(|_| true).await;

        sender.send(1).await.unwrap();
        sender.send(2).await.unwrap();

        assert_eq!(all.recv().await, Some(1));
        assert_eq!(all.recv().await, Some(2));
        assert_eq!(evens.recv().await, Some(2));
    }

    #[tokio::test]
    async fn prunes_dropped_subscribers() {
        let (mut hub, sender) = EventHub::<u32>::setup();
        let sub = hub.subscribe(|_| true).await;
        drop(sub);
        assert_eq!(sender.send(7).await, Err(NoSubscribers));
    }
}
