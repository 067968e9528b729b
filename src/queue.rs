use crate::packet::TunnelPacket;

const EWMA_WEIGHT: f32 = 0.5;

fn ewma(last: f32, current: usize) -> f32 {
    (1.0 - EWMA_WEIGHT) * last + EWMA_WEIGHT * current as f32
}

/// Bounded circular FIFO of owned packets.
///
/// One slot is always kept free so `front == rear` unambiguously means
/// empty; a queue of capacity `C` therefore holds at most `C - 1` packets.
/// Alongside the packet count it tracks the byte total and an exponentially
/// smoothed fullness, both updated on every enqueue and dequeue.
#[derive(Debug)]
pub struct PacketQueue {
    name: &'static str,
    slots: Vec<Option<TunnelPacket>>,
    front: usize,
    rear: usize,
    fullness: usize,
    byte_fullness: usize,
    smoothed_fullness: f32,
}

impl PacketQueue {
    pub fn new(capacity: usize, name: &'static str) -> Self {
        assert!(capacity >= 2, "capacity must leave room for the reserved slot");
        log::debug!("{name}: initializing packet queue, capacity {capacity}");
        Self {
            name,
            slots: (0..capacity).map(|_| None).collect(),
            front: 0,
            rear: 0,
            fullness: 0,
            byte_fullness: 0,
            smoothed_fullness: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.front == self.rear
    }
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
    pub fn fullness(&self) -> usize {
        self.fullness
    }
    pub fn byte_fullness(&self) -> usize {
        self.byte_fullness
    }
    pub fn smoothed_fullness(&self) -> f32 {
        self.smoothed_fullness
    }

    /// Take ownership of `packet`, or hand it back untouched when the queue
    /// is full.
    pub fn enqueue(&mut self, packet: TunnelPacket) -> Result<(), TunnelPacket> {
        let next = (self.rear + 1) % self.slots.len();
        if next == self.front {
            log::debug!("{}: overflow, rejecting {} byte frame", self.name, packet.len());
            return Err(packet);
        }
        self.rear = next;
        self.fullness += 1;
        self.byte_fullness += packet.len();
        self.smoothed_fullness = ewma(self.smoothed_fullness, self.fullness);
        self.slots[self.rear] = Some(packet);
        self.log_state('e');
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<TunnelPacket> {
        if self.is_empty() {
            return None;
        }
        self.front = (self.front + 1) % self.slots.len();
        // front != rear was excluded above, so the slot is occupied
        let packet = self.slots[self.front].take().unwrap();
        self.fullness -= 1;
        self.byte_fullness -= packet.len();
        self.smoothed_fullness = ewma(self.smoothed_fullness, self.fullness);
        self.log_state('d');
        Some(packet)
    }

    /// The packet the next `dequeue` would return.
    pub fn peek(&self) -> Option<&TunnelPacket> {
        if self.is_empty() {
            return None;
        }
        self.slots[(self.front + 1) % self.slots.len()].as_ref()
    }

    fn log_state(&self, event: char) {
        log::debug!(
            "{} {}: front={} rear={} fullness={} sfullness={:.2} bfullness={}",
            self.name,
            event,
            self.front,
            self.rear,
            self.fullness,
            self.smoothed_fullness,
            self.byte_fullness,
        );
    }
}
