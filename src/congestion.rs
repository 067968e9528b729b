use crate::packet::{self, TunnelPacket};
use crate::queue::PacketQueue;

/// Phase of the backward congestion-signalling machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Normal forwarding in both directions.
    Idle,
    /// The tap-side queue crossed its high-water mark; the trigger sequence
    /// is latched.
    Armed,
    /// Counting tap-side arrivals until the next reverse-path write, as an
    /// estimate of the sender's packets in flight.
    Counting,
    /// Waiting for a genuine pure ACK from the peer to clone as the
    /// duplicate-ACK template.
    CapturingAck,
    /// Emitting one burst of fabricated duplicate ACKs per reverse-path
    /// write; the payload is the number of completed rounds.
    Spoofing(u32),
}

enum State {
    Idle,
    Armed,
    Counting,
    CapturingAck,
    Spoofing { round: u32, template: TunnelPacket },
}

/// What the main loop should do with the reverse path on a write
/// opportunity.
#[derive(Debug)]
pub enum ReverseAction {
    /// Nothing queued; release the pacing deadline.
    QueueEmpty,
    /// Write this packet to the tap unchanged.
    Forward(TunnelPacket),
    /// Write this burst of fabricated duplicate ACKs to the tap; the
    /// packet that prompted the round has been consumed.
    Burst(Vec<TunnelPacket>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundVerdict {
    Forward,
    Suppress,
}

/// Backward congestion signalling: when the tap-side queue threatens to
/// overflow, fabricate bursts of duplicate ACKs toward the local sender so
/// its TCP backs off before anything is actually dropped.
///
/// The machine watches the forward path for the high-water trigger and the
/// retransmissions it provokes, and drives the reverse path through
/// template capture and per-round bursts until the peer's real ACK covers
/// the trigger sequence.
pub struct AckSpoofer {
    enabled: bool,
    high_water: usize,
    state: State,
    trigger_seq: Option<u32>,
    pkt_count: u16,
}

impl AckSpoofer {
    /// `enabled` is false in tap mode: spoofing is only defined over raw
    /// IPv4 frames.
    pub fn new(high_water: usize, enabled: bool) -> Self {
        Self {
            enabled,
            high_water,
            state: State::Idle,
            trigger_seq: None,
            pkt_count: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        match &self.state {
            State::Idle => Phase::Idle,
            State::Armed => Phase::Armed,
            State::Counting => Phase::Counting,
            State::CapturingAck => Phase::CapturingAck,
            State::Spoofing { round, .. } => Phase::Spoofing(*round),
        }
    }

    /// Forward-path hook, called for every frame read from the tap before
    /// it is enqueued. Counts arrivals during the RTT probe and drops
    /// retransmissions of the trigger segment (the fabricated dupacks made
    /// the local sender resend it; the peer never lost it).
    pub fn on_tap_inbound(&mut self, pkt: &TunnelPacket) -> InboundVerdict {
        if !self.enabled {
            return InboundVerdict::Forward;
        }
        if matches!(self.state, State::Counting) {
            self.pkt_count = self.pkt_count.saturating_add(1);
        }
        match (self.trigger_seq, packet::tcp_seq(pkt.data())) {
            (Some(trigger), Some(seq)) if seq == trigger => {
                log::debug!("suppressing retransmission of trigger seq {seq}");
                InboundVerdict::Suppress
            }
            _ => InboundVerdict::Forward,
        }
    }

    /// High-water check, called after every successful enqueue on the
    /// forward path with the sequence number of the enqueued frame.
    pub fn on_enqueued(&mut self, seq: Option<u32>, fullness: usize) {
        if !self.enabled || !matches!(self.state, State::Idle) {
            return;
        }
        if fullness <= self.high_water {
            return;
        }
        let Some(seq) = seq else {
            return;
        };
        self.trigger_seq = Some(seq);
        self.state = State::Armed;
        log::debug!("backward congestion signal armed at fullness {fullness}, trigger seq {seq}");
    }

    /// Reverse-path driver, called on every tap write opportunity.
    pub fn on_tap_write(&mut self, qsock: &mut PacketQueue) -> ReverseAction {
        if matches!(self.state, State::Counting) {
            // the probe window closes at the write after the one that
            // opened it
            self.state = State::CapturingAck;
            log::debug!("counted {} packets in flight, waiting for a pure ack", self.pkt_count);
        }

        let Some(pkt) = qsock.dequeue() else {
            return ReverseAction::QueueEmpty;
        };

        if matches!(self.state, State::Spoofing { .. }) {
            if let (Some(trigger), Some(ack)) = (self.trigger_seq, packet::tcp_ack_seq(pkt.data())) {
                if ack >= trigger {
                    log::debug!("peer ack {ack} covers trigger {trigger}, ending spoofing");
                    self.state = State::Idle;
                    self.trigger_seq = None;
                    self.pkt_count = 0;
                    return ReverseAction::Forward(pkt);
                }
            }
        }

        match &mut self.state {
            State::Idle => ReverseAction::Forward(pkt),
            State::Counting => unreachable!("the probe window closed at the top of this call"),
            State::Armed => {
                self.state = State::Counting;
                ReverseAction::Forward(pkt)
            }
            State::CapturingAck => {
                if packet::is_cloneable_ack(pkt.data()) {
                    log::debug!(
                        "captured dupack template, ack {:?}",
                        packet::tcp_ack_seq(pkt.data())
                    );
                    self.state = State::Spoofing {
                        round: 1,
                        template: TunnelPacket::from_slice(pkt.data()),
                    };
                }
                ReverseAction::Forward(pkt)
            }
            State::Spoofing { round, template } => {
                let count = u32::from(self.pkt_count);
                let tsval = packet::timestamp_val(pkt.data())
                    .or_else(|| packet::timestamp_val(template.data()))
                    .unwrap_or(0);
                let mut burst = Vec::with_capacity(count as usize);
                for i in 0..count {
                    let plus = (round.wrapping_sub(1).wrapping_mul(count))
                        .wrapping_add(i + 1) as u16;
                    if let Some(dupack) = packet::build_dupack(template.data(), plus, tsval) {
                        burst.push(dupack);
                    }
                }
                log::debug!("spoofing round {round}: emitting {} dupacks", burst.len());
                *round += 1;
                ReverseAction::Burst(burst)
            }
        }
    }
}
