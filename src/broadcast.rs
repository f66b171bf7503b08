use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

pub const DEFAULT_CAPACITY: usize = 64;

/// One-to-many fan-out over bounded `mpsc` channels. A subscriber that
/// falls `capacity` events behind misses new events until it drains;
/// subscribers that hang up are pruned on the next publish.
pub struct Broadcast<T> {
    subscribers: Arc<Mutex<Vec<SyncSender<T>>>>,
    capacity: usize,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
            capacity: self.capacity,
        }
    }
}

impl<T> Default for Broadcast<T> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl<T> Broadcast<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }
}

impl<T: Clone> Broadcast<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = mpsc::sync_channel(self.capacity);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    pub fn publish(&self, event: T) -> usize {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return 0;
        };
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = Broadcast::new();
        let kept = bus.subscribe();
        let dropped = bus.subscribe();
        drop(dropped);

        assert_eq!(bus.publish(5_u32), 1);
        assert_eq!(kept.try_recv().expect("event"), 5);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn idle_subscriber_backlog_is_capped() {
        let bus = Broadcast::with_capacity(4);
        let idle = bus.subscribe();
        for n in 0..100_u32 {
            assert_eq!(bus.publish(n), 1);
        }

        let backlog: Vec<u32> = idle.try_iter().collect();
        assert_eq!(backlog, vec![0, 1, 2, 3]);

        bus.publish(100);
        assert_eq!(idle.try_recv().expect("room again"), 100);
    }
}
