//! Fan-out of session change hints.

use pmxterm_proto::Notification;
use tokio::sync::broadcast;

/// Broadcasts [`Notification`]s to every subscriber.
///
/// Delivery is best-effort: a subscriber that falls more than the channel
/// capacity behind loses the oldest events, and publishing with nobody
/// listening is not an error.
#[derive(Clone, Debug)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, notification: Notification) {
        log::trace!("notify {notification:?}");
        let _ = self.tx.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmxterm_proto::NotificationKind;

    #[test]
    fn test_publish_without_subscribers() {
        let notifier = Notifier::new(4);
        notifier.publish(Notification::changed("a"));
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn test_every_subscriber_sees_events() {
        let notifier = Notifier::new(4);
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        notifier.publish(Notification::buried("a"));

        assert_eq!(first.try_recv().unwrap().kind, NotificationKind::Buried);
        assert_eq!(second.try_recv().unwrap().session, "a");
    }

    #[test]
    fn test_lagging_subscriber_loses_oldest() {
        let notifier = Notifier::new(2);
        let mut rx = notifier.subscribe();
        for id in ["a", "b", "c"] {
            notifier.publish(Notification::changed(id));
        }

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(1))
        ));
        assert_eq!(rx.try_recv().unwrap().session, "b");
        assert_eq!(rx.try_recv().unwrap().session, "c");
    }
}
