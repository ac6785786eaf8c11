use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bit_set::BitSet;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{trace, warn};

use crate::transport::packet::{write_data_header, DeliveryClass};
use crate::transport::sequence::{SeqNum, SEQ_MODULUS};

/// Fast retransmit on a detected ack hole is suppressed while the packet was (re)sent
///  within this fraction of the base resend delay.
const FAST_RETRANSMIT_COOLDOWN: f32 = 0.35;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendOutcome {
    /// The message went out immediately; it was within the allowed-send budget.
    Sent,
    /// The message is waiting for window room. Queued messages are bounded by memory only.
    Queued,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ArqSenderStats {
    /// Packets put on the wire, retransmissions included.
    pub packets_sent: u64,
    /// Retransmissions triggered by the periodic resend scan.
    pub delay_resends: u64,
    /// Fast retransmissions triggered by a detected ack gap.
    pub hole_resends: u64,
}

struct StoredPacket {
    wire: Bytes,
    send_count: u32,
    last_sent: Instant,
}

/// The sender half of one selective-repeat ARQ channel: a sliding window of at most
///  `window_size` in-flight packets, stored in a dense slot ring indexed `seq % W`, plus
///  a dense ack bit per sequence number for acks that arrive out of order.
///
/// Slots store the final wire bytes, so retransmissions repeat the packet unchanged
///  (same sequence, same payload - and, on encrypted connections, the same ciphertext).
pub struct ArqSender {
    class: DeliveryClass,
    window_size: u16,
    resend_delay: Duration,

    /// oldest unacknowledged sequence; the window never trails `send_start` by more
    ///  than `window_size`
    window_start: SeqNum,
    /// next sequence to assign
    send_start: SeqNum,
    slots: Vec<Option<StoredPacket>>,
    /// marks sequences acked out of order, not yet consumed by a window slide
    ack_bits: BitSet,

    pending: VecDeque<Bytes>,
    stats: ArqSenderStats,
}

impl ArqSender {
    pub fn new(class: DeliveryClass, window_size: u16, resend_delay: Duration) -> ArqSender {
        assert!(window_size > 0 && window_size <= SEQ_MODULUS);

        ArqSender {
            class,
            window_size,
            resend_delay,
            window_start: SeqNum::ZERO,
            send_start: SeqNum::ZERO,
            slots: (0..window_size).map(|_| None).collect(),
            ack_bits: BitSet::with_capacity(SEQ_MODULUS as usize),
            pending: VecDeque::new(),
            stats: ArqSenderStats::default(),
        }
    }

    pub fn stats(&self) -> ArqSenderStats {
        self.stats
    }

    /// Number of in-flight, unacknowledged packets.
    pub fn outstanding(&self) -> u16 {
        let distance = self.send_start.circular_distance(self.window_start);
        debug_assert!(distance >= 0 && distance <= self.window_size as i16);
        distance as u16
    }

    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    fn allowed_sends(&self) -> u16 {
        self.window_size - self.outstanding()
    }

    /// Registers a message payload for sending. If there is window room and nothing is
    ///  queued ahead of it, the packet goes out immediately; otherwise it waits for
    ///  acks to open the window.
    pub fn enqueue(&mut self, payload: Bytes, now: Instant, out: &mut Vec<Bytes>) -> SendOutcome {
        if self.allowed_sends() > 0 && self.pending.is_empty() {
            self.transmit_new(payload, now, out);
            SendOutcome::Sent
        }
        else {
            self.pending.push_back(payload);
            SendOutcome::Queued
        }
    }

    /// Periodic driver: retransmits everything unacked past the resend delay, then fills
    ///  the window from the pending queue.
    pub fn tick(&mut self, now: Instant, out: &mut Vec<Bytes>) {
        for slot in self.slots.iter_mut().flatten() {
            if now.duration_since(slot.last_sent) > self.resend_delay {
                trace!("delay resend on {:?} channel (send count {})", self.class, slot.send_count);
                slot.send_count += 1;
                slot.last_sent = now;
                self.stats.delay_resends += 1;
                self.stats.packets_sent += 1;
                out.push(slot.wire.clone());
            }
        }

        while self.allowed_sends() > 0 {
            match self.pending.pop_front() {
                Some(payload) => self.transmit_new(payload, now, out),
                None => break,
            }
        }
    }

    pub fn receive_ack(&mut self, seq: SeqNum, now: Instant, out: &mut Vec<Bytes>) {
        let relate = seq.circular_distance(self.window_start);

        if relate < 0 {
            trace!("duplicate/late ack {} on {:?} channel - ignoring", seq, self.class);
            return;
        }

        if relate == 0 {
            if self.window_start == self.send_start {
                warn!("ack {} for a sequence that was never sent on {:?} channel - dropping", seq, self.class);
                return;
            }
            self.slide_window();
            return;
        }

        // early ack: the in-order predecessor(s) are still outstanding
        if seq.circular_distance(self.send_start) >= 0 {
            warn!("ack {} for a sequence that was never sent on {:?} channel - dropping", seq, self.class);
            return;
        }
        if self.ack_bits.contains(seq.to_raw() as usize) {
            trace!("duplicate early ack {} on {:?} channel - ignoring", seq, self.class);
            return;
        }
        self.ack_bits.insert(seq.to_raw() as usize);
        self.free_slot(seq);

        // every hole below the early ack is evidence of loss: fast retransmit the
        //  packets sent exactly once, outside the cooldown
        let cooldown = self.resend_delay.mul_f32(FAST_RETRANSMIT_COOLDOWN);
        let mut cur = self.window_start;
        while cur != seq {
            if !self.ack_bits.contains(cur.to_raw() as usize) {
                if let Some(slot) = &mut self.slots[cur.slot_index(self.window_size)] {
                    if slot.send_count == 1 && now.duration_since(slot.last_sent) > cooldown {
                        trace!("hole resend of {} on {:?} channel", cur, self.class);
                        slot.send_count += 1;
                        slot.last_sent = now;
                        self.stats.hole_resends += 1;
                        self.stats.packets_sent += 1;
                        out.push(slot.wire.clone());
                    }
                }
            }
            cur = cur.next();
        }
    }

    /// Drops all in-flight and queued state, e.g. when the connection dies.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.ack_bits.clear();
        self.pending.clear();
        self.window_start = self.send_start;
    }

    fn transmit_new(&mut self, payload: Bytes, now: Instant, out: &mut Vec<Bytes>) {
        let seq = self.send_start;
        self.send_start = self.send_start.next();

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        write_data_header(&mut buf, self.class, seq);
        buf.put_slice(&payload);
        let wire = buf.freeze();

        let idx = seq.slot_index(self.window_size);
        assert!(self.slots[idx].is_none(), "sequence {} assigned while its slot is still in flight", seq);
        self.slots[idx] = Some(StoredPacket {
            wire: wire.clone(),
            send_count: 1,
            last_sent: now,
        });

        trace!("sending {} on {:?} channel ({} bytes)", seq, self.class, wire.len());
        self.stats.packets_sent += 1;
        out.push(wire);
    }

    /// Frees `window_start` and cascades over every sequence whose early ack already
    ///  arrived.
    fn slide_window(&mut self) {
        loop {
            self.free_slot(self.window_start);
            self.ack_bits.remove(self.window_start.to_raw() as usize);
            self.window_start = self.window_start.next();

            if !self.ack_bits.contains(self.window_start.to_raw() as usize) {
                break;
            }
        }
        trace!("window on {:?} channel slid to {}", self.class, self.window_start);
    }

    fn free_slot(&mut self, seq: SeqNum) {
        self.slots[seq.slot_index(self.window_size)] = None;
    }

    #[cfg(test)]
    fn window_start(&self) -> SeqNum {
        self.window_start
    }

    #[cfg(test)]
    fn send_start(&self) -> SeqNum {
        self.send_start
    }

    #[cfg(test)]
    fn occupied_slots(&self) -> Vec<bool> {
        self.slots.iter().map(|s| s.is_some()).collect()
    }
}
