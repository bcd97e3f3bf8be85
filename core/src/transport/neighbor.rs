//! One-hop neighbor records

use crate::nodelist::NodeEntry;
use crate::NodeId;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub id: NodeId,
    pub last_heard: Instant,
    /// Running average of received signal strength
    pub rssi: u8,
    /// Transport seq of the last frame heard from this neighbor
    pub seq: u8,
    samples: u8,
}

impl Neighbor {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            last_heard: Instant::now(),
            rssi: 0,
            seq: 0,
            samples: 0,
        }
    }

    /// Fold in a received frame; returns the seq heard before this one
    pub fn update(&mut self, seq: u8, rssi: u8, avg_count: u8) -> u8 {
        let n = avg_count.max(1) as u16;
        self.rssi = if self.samples == 0 {
            rssi
        } else {
            ((self.rssi as u16 * (n - 1) + rssi as u16) / n) as u8
        };
        self.samples = self.samples.saturating_add(1);
        self.last_heard = Instant::now();
        std::mem::replace(&mut self.seq, seq)
    }
}

impl NodeEntry for Neighbor {
    fn id(&self) -> NodeId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_seeds_average() {
        let mut n = Neighbor::new(2);
        n.update(1, 120, 5);
        assert_eq!(n.rssi, 120);
    }

    #[test]
    fn test_running_average() {
        let mut n = Neighbor::new(2);
        n.update(1, 100, 5);
        n.update(2, 200, 5);
        // (100 * 4 + 200) / 5
        assert_eq!(n.rssi, 120);
        n.update(3, 255, 5);
        assert_eq!(n.rssi, 147);
    }

    #[test]
    fn test_update_returns_previous_seq() {
        let mut n = Neighbor::new(3);
        assert_eq!(n.update(10, 50, 1), 0);
        assert_eq!(n.update(11, 50, 1), 10);
        assert_eq!(n.update(11, 50, 1), 11);
        assert_eq!(n.seq, 11);
    }
}
