//! In-memory broadcast medium
//!
//! Every `SimRadio` attached to a `SimMedium` hears the transmissions of the
//! stations it has a link to. Links are symmetric and carry an RSSI and a
//! loss probability. A fresh medium is a full mesh; `line` or `set_link`
//! switch it to an explicit topology.

use super::{Radio, RadioError, RxBuffer, RADIO_MTU};
use crate::NodeId;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

/// Signal quality of a link between two stations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkQuality {
    pub rssi: u8,
    /// Probability in `0.0..=1.0` that a transmission is lost on this link
    pub loss: f64,
}

impl LinkQuality {
    pub fn new(rssi: u8) -> Self {
        Self { rssi, loss: 0.0 }
    }

    pub fn with_loss(mut self, loss: f64) -> Self {
        self.loss = loss.clamp(0.0, 1.0);
        self
    }
}

impl Default for LinkQuality {
    fn default() -> Self {
        Self::new(200)
    }
}

/// A transmission observed on the medium
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub from: NodeId,
    pub bytes: Vec<u8>,
}

struct Station {
    token: u64,
    tx: mpsc::UnboundedSender<RxBuffer>,
}

struct MediumInner {
    stations: HashMap<NodeId, Station>,
    /// Explicit link table, keyed by (lower id, higher id). `None` is a cut link.
    links: HashMap<(NodeId, NodeId), Option<LinkQuality>>,
    full_mesh: bool,
    default_link: LinkQuality,
}

impl MediumInner {
    fn link(&self, a: NodeId, b: NodeId) -> Option<LinkQuality> {
        match self.links.get(&link_key(a, b)) {
            Some(link) => *link,
            None if self.full_mesh => Some(self.default_link),
            None => None,
        }
    }
}

fn link_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Clone)]
pub struct SimMedium {
    inner: Arc<Mutex<MediumInner>>,
    tap: broadcast::Sender<Transmission>,
    next_token: Arc<AtomicU64>,
}

impl SimMedium {
    /// Full-mesh medium where every link has the default quality
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(MediumInner {
                stations: HashMap::new(),
                links: HashMap::new(),
                full_mesh: true,
                default_link: LinkQuality::default(),
            })),
            tap,
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Medium where only consecutive ids in `ids` hear each other
    pub fn line(ids: &[NodeId]) -> Self {
        let medium = Self::new();
        {
            let mut inner = medium.inner.lock();
            inner.full_mesh = false;
            for pair in ids.windows(2) {
                inner
                    .links
                    .insert(link_key(pair[0], pair[1]), Some(LinkQuality::default()));
            }
        }
        medium
    }

    /// Attach a station; an existing station with the same id is replaced
    pub fn attach(&self, id: NodeId) -> SimRadio {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().stations.insert(id, Station { token, tx });
        SimRadio {
            id,
            token,
            medium: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn set_link(&self, a: NodeId, b: NodeId, quality: LinkQuality) {
        self.inner.lock().links.insert(link_key(a, b), Some(quality));
    }

    pub fn cut_link(&self, a: NodeId, b: NodeId) {
        self.inner.lock().links.insert(link_key(a, b), None);
    }

    pub fn link(&self, a: NodeId, b: NodeId) -> Option<LinkQuality> {
        self.inner.lock().link(a, b)
    }

    /// Subscribe to every transmission made on the medium
    pub fn tap(&self) -> broadcast::Receiver<Transmission> {
        self.tap.subscribe()
    }

    fn deliver(&self, from: NodeId, bytes: &[u8]) {
        let _ = self.tap.send(Transmission {
            from,
            bytes: bytes.to_vec(),
        });

        let inner = self.inner.lock();
        let mut rng = rand::thread_rng();
        for (&id, station) in inner.stations.iter() {
            if id == from {
                continue;
            }
            let Some(link) = inner.link(from, id) else {
                continue;
            };
            if link.loss > 0.0 && rng.gen_bool(link.loss) {
                trace!("medium: {} -> {} lost", from, id);
                continue;
            }
            let _ = station.tx.send(RxBuffer {
                data: bytes.to_vec(),
                rssi: link.rssi,
            });
        }
    }

    fn detach(&self, id: NodeId, token: u64) {
        let mut inner = self.inner.lock();
        if inner.stations.get(&id).map(|s| s.token) == Some(token) {
            inner.stations.remove(&id);
        }
    }
}

impl Default for SimMedium {
    fn default() -> Self {
        Self::new()
    }
}

/// A station on a `SimMedium`
pub struct SimRadio {
    id: NodeId,
    token: u64,
    medium: SimMedium,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RxBuffer>>,
}

impl SimRadio {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Next buffer if one is already waiting
    pub fn try_receive(&self) -> Option<RxBuffer> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

#[async_trait]
impl Radio for SimRadio {
    async fn transmit(&self, data: &[u8]) -> Result<(), RadioError> {
        if data.len() > RADIO_MTU {
            return Err(RadioError::TooLong(data.len()));
        }
        self.medium.deliver(self.id, data);
        Ok(())
    }

    async fn receive(&self) -> Result<RxBuffer, RadioError> {
        self.rx.lock().await.recv().await.ok_or(RadioError::Closed)
    }
}

impl Drop for SimRadio {
    fn drop(&mut self) {
        self.medium.detach(self.id, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_mesh_delivers_to_others_only() {
        let medium = SimMedium::new();
        let a = medium.attach(1);
        let b = medium.attach(2);
        let c = medium.attach(3);

        a.transmit(&[1, 2, 3]).await.unwrap();

        assert_eq!(b.receive().await.unwrap().data, vec![1, 2, 3]);
        assert_eq!(c.receive().await.unwrap().rssi, 200);
        assert!(a.try_receive().is_none());
    }

    #[tokio::test]
    async fn test_line_topology() {
        let medium = SimMedium::line(&[1, 2, 3]);
        let a = medium.attach(1);
        let b = medium.attach(2);
        let c = medium.attach(3);

        a.transmit(&[9]).await.unwrap();
        assert!(b.try_receive().is_some());
        assert!(c.try_receive().is_none());

        b.transmit(&[8]).await.unwrap();
        assert!(a.try_receive().is_some());
        assert!(c.try_receive().is_some());
    }

    #[tokio::test]
    async fn test_cut_and_lossy_links() {
        let medium = SimMedium::new();
        let a = medium.attach(1);
        let b = medium.attach(2);

        medium.cut_link(1, 2);
        a.transmit(&[1]).await.unwrap();
        assert!(b.try_receive().is_none());

        medium.set_link(2, 1, LinkQuality::new(90).with_loss(1.0));
        a.transmit(&[1]).await.unwrap();
        assert!(b.try_receive().is_none());

        medium.set_link(1, 2, LinkQuality::new(90));
        a.transmit(&[1]).await.unwrap();
        assert_eq!(b.try_receive().unwrap().rssi, 90);
    }

    #[tokio::test]
    async fn test_rejects_oversized_buffer() {
        let medium = SimMedium::new();
        let a = medium.attach(1);
        let err = a.transmit(&[0u8; RADIO_MTU + 1]).await.unwrap_err();
        assert_eq!(err, RadioError::TooLong(RADIO_MTU + 1));
    }

    #[tokio::test]
    async fn test_tap_sees_transmissions() {
        let medium = SimMedium::new();
        let mut tap = medium.tap();
        let a = medium.attach(4);
        a.transmit(&[5, 5]).await.unwrap();

        let seen = tap.recv().await.unwrap();
        assert_eq!(seen.from, 4);
        assert_eq!(seen.bytes, vec![5, 5]);
    }

    #[tokio::test]
    async fn test_drop_detaches_station() {
        let medium = SimMedium::new();
        let a = medium.attach(1);
        let b = medium.attach(2);
        drop(b);
        a.transmit(&[1]).await.unwrap();
        // a re-attached station with the same id starts with an empty inbox
        let b = medium.attach(2);
        assert!(b.try_receive().is_none());
    }
}
