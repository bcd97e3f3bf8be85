//! Port listeners
//!
//! The router holds the producing half of each listener queue; the
//! application task holds the `Listener` with the consuming half. Messages for
//! a port with no active listener are dropped.

use super::message::{Message, Port};
use super::RouterError;
use crate::queue::{ring, Consumer, Producer};
use crate::NodeId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Listener slots per router; every slot is usable
pub const MAX_LISTENERS: usize = 18;

struct ListenerSlot {
    port: Port,
    tx: Producer<Message>,
    notify: Arc<Notify>,
    active: Arc<AtomicBool>,
}

/// Outcome of handing a message to the listener table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    NoListener,
    QueueFull,
}

pub(crate) struct ListenerTable {
    slots: Vec<ListenerSlot>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(MAX_LISTENERS),
        }
    }

    pub fn register(
        &mut self,
        node: NodeId,
        port: Port,
        capacity: usize,
    ) -> Result<Listener, RouterError> {
        if self.slots.iter().any(|slot| slot.port == port) {
            return Err(RouterError::DuplicatePort(port));
        }
        if self.slots.len() >= MAX_LISTENERS {
            return Err(RouterError::ListenerTableFull);
        }

        let (tx, rx) = ring(capacity);
        let notify = Arc::new(Notify::new());
        let active = Arc::new(AtomicBool::new(false));
        self.slots.push(ListenerSlot {
            port,
            tx,
            notify: Arc::clone(&notify),
            active: Arc::clone(&active),
        });

        Ok(Listener {
            node,
            port,
            rx,
            notify,
            active,
        })
    }

    pub fn deliver(&self, msg: Message) -> Delivery {
        let Some(slot) = self
            .slots
            .iter()
            .find(|slot| slot.port == msg.port && slot.active.load(Ordering::Acquire))
        else {
            return Delivery::NoListener;
        };
        if slot.tx.push(msg).is_err() {
            return Delivery::QueueFull;
        }
        slot.notify.notify_one();
        Delivery::Delivered
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Receiving end of a registered port
pub struct Listener {
    node: NodeId,
    port: Port,
    rx: Consumer<Message>,
    notify: Arc<Notify>,
    active: Arc<AtomicBool>,
}

impl Listener {
    pub fn port(&self) -> Port {
        self.port
    }

    /// Start accepting messages on this port
    pub fn activate(&self) {
        debug!(node = self.node, "activate listener: port {}", self.port);
        self.active.store(true, Ordering::Release);
    }

    pub fn deactivate(&self) {
        debug!(node = self.node, "deactivate listener: port {}", self.port);
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.rx.pop()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Wait until the router signals a new message
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Next message, waiting as long as it takes
    pub async fn recv(&self) -> Message {
        loop {
            if let Some(msg) = self.rx.pop() {
                return msg;
            }
            self.notify.notified().await;
        }
    }

    /// Next message, or `None` once `deadline` passes
    pub async fn recv_until(&self, deadline: Instant) -> Option<Message> {
        loop {
            if let Some(msg) = self.rx.pop() {
                return Some(msg);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = sleep_until(deadline) => return self.rx.pop(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn msg(port: Port, seq: u8) -> Message {
        let mut msg = Message::new(1, port, 0, &[seq]).unwrap();
        msg.seq = seq;
        msg
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let mut table = ListenerTable::new();
        let _a = table.register(1, 5, 2).unwrap();
        assert!(matches!(
            table.register(1, 5, 2),
            Err(RouterError::DuplicatePort(5))
        ));
    }

    #[test]
    fn test_table_capacity() {
        let mut table = ListenerTable::new();
        let _held: Vec<_> = (0..MAX_LISTENERS as Port)
            .map(|port| table.register(1, port, 1).unwrap())
            .collect();
        assert_eq!(table.len(), 18);
        assert!(matches!(
            table.register(1, 200, 1),
            Err(RouterError::ListenerTableFull)
        ));
    }

    #[test]
    fn test_delivery_requires_active_listener() {
        let mut table = ListenerTable::new();
        let listener = table.register(1, 5, 2).unwrap();

        assert_eq!(table.deliver(msg(5, 1)), Delivery::NoListener);
        listener.activate();
        assert_eq!(table.deliver(msg(5, 2)), Delivery::Delivered);
        assert_eq!(table.deliver(msg(6, 3)), Delivery::NoListener);
        listener.deactivate();
        assert_eq!(table.deliver(msg(5, 4)), Delivery::NoListener);

        assert_eq!(listener.try_recv().map(|m| m.seq), Some(2));
        assert!(listener.try_recv().is_none());
    }

    #[test]
    fn test_full_queue_drops() {
        let mut table = ListenerTable::new();
        let listener = table.register(1, 5, 1).unwrap();
        listener.activate();
        assert_eq!(table.deliver(msg(5, 1)), Delivery::Delivered);
        assert_eq!(table.deliver(msg(5, 2)), Delivery::QueueFull);
        assert_eq!(listener.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_wakes_on_delivery() {
        let mut table = ListenerTable::new();
        let listener = table.register(1, 5, 2).unwrap();
        listener.activate();

        assert!(listener
            .recv_until(Instant::now() + Duration::from_millis(10))
            .await
            .is_none());

        table.deliver(msg(5, 7));
        assert_eq!(listener.recv().await.seq, 7);
    }
}
