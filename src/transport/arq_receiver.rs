use bit_set::BitSet;
use bytes::Bytes;
use tracing::{trace, warn};

use crate::transport::packet::DeliveryClass;
use crate::transport::sequence::{SeqNum, SEQ_MODULUS};

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ArqReceiverStats {
    pub packets_received: u64,
    pub duplicates: u64,
    pub out_of_window: u64,
}

/// The receiver half of one reliable-ordered ARQ channel: acknowledges every received
///  data packet (duplicates included, so lost acks get repaired), delivers payloads in
///  sequence order, and buffers out-of-order arrivals in a dense ring bounded by the
///  window width.
pub struct ArqReceiver {
    class: DeliveryClass,
    window_size: u16,

    /// next sequence expected for in-order delivery
    window_start: SeqNum,
    slots: Vec<Option<Bytes>>,
    /// marks sequences received out of order, not yet consumed by the delivery slide
    received_bits: BitSet,

    stats: ArqReceiverStats,
}

impl ArqReceiver {
    pub fn new(class: DeliveryClass, window_size: u16) -> ArqReceiver {
        assert!(window_size > 0 && window_size <= SEQ_MODULUS);

        ArqReceiver {
            class,
            window_size,
            window_start: SeqNum::ZERO,
            slots: (0..window_size).map(|_| None).collect(),
            received_bits: BitSet::with_capacity(SEQ_MODULUS as usize),
            stats: ArqReceiverStats::default(),
        }
    }

    pub fn stats(&self) -> ArqReceiverStats {
        self.stats
    }

    /// Handles one received data packet. Sequences to acknowledge go into `acks`,
    ///  payloads that became deliverable in order go into `delivered`.
    pub fn on_packet(
        &mut self,
        seq: SeqNum,
        payload: Bytes,
        acks: &mut Vec<SeqNum>,
        delivered: &mut Vec<Bytes>,
    ) {
        let relate = seq.circular_distance(self.window_start);

        if relate < 0 {
            // already consumed - the ack for it may have been lost, so ack again
            trace!("duplicate packet {} on {:?} channel - re-acking", seq, self.class);
            self.stats.duplicates += 1;
            acks.push(seq);
            return;
        }

        if relate >= self.window_size as i16 {
            warn!(
                "packet {} on {:?} channel is beyond the receive window starting at {} - dropping",
                seq, self.class, self.window_start
            );
            self.stats.out_of_window += 1;
            return;
        }

        acks.push(seq);

        if relate == 0 {
            self.stats.packets_received += 1;
            delivered.push(payload);
            self.window_start = self.window_start.next();

            // flush everything that arrived early and is now in order
            while self.received_bits.contains(self.window_start.to_raw() as usize) {
                self.received_bits.remove(self.window_start.to_raw() as usize);
                let buffered = self.slots[self.window_start.slot_index(self.window_size)]
                    .take()
                    .expect("a set received bit implies a buffered payload");
                delivered.push(buffered);
                self.window_start = self.window_start.next();
            }
            return;
        }

        // out of order, within the window
        if self.received_bits.contains(seq.to_raw() as usize) {
            trace!("duplicate out-of-order packet {} on {:?} channel", seq, self.class);
            self.stats.duplicates += 1;
            return;
        }
        trace!("buffering out-of-order packet {} on {:?} channel", seq, self.class);
        self.stats.packets_received += 1;
        self.received_bits.insert(seq.to_raw() as usize);
        self.slots[seq.slot_index(self.window_size)] = Some(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const W: u16 = 8;

    fn receiver() -> ArqReceiver {
        ArqReceiver::new(DeliveryClass::ReliableOrdered, W)
    }

    fn payload(tag: u8) -> Bytes {
        Bytes::from(vec![tag])
    }

    fn on(receiver: &mut ArqReceiver, seq: u16, tag: u8) -> (Vec<SeqNum>, Vec<Bytes>) {
        let mut acks = Vec::new();
        let mut delivered = Vec::new();
        receiver.on_packet(SeqNum::from_raw(seq), payload(tag), &mut acks, &mut delivered);
        (acks, delivered)
    }

    #[test]
    fn test_in_order_delivery() {
        let mut receiver = receiver();
        for i in 0..3 {
            let (acks, delivered) = on(&mut receiver, i, i as u8);
            assert_eq!(acks, vec![SeqNum::from_raw(i)]);
            assert_eq!(delivered, vec![payload(i as u8)]);
        }
    }

    #[test]
    fn test_out_of_order_is_buffered_and_flushed_in_order() {
        let mut receiver = receiver();

        let (acks, delivered) = on(&mut receiver, 2, 2);
        assert_eq!(acks, vec![SeqNum::from_raw(2)]);
        assert!(delivered.is_empty());

        let (acks, delivered) = on(&mut receiver, 1, 1);
        assert_eq!(acks, vec![SeqNum::from_raw(1)]);
        assert!(delivered.is_empty());

        let (acks, delivered) = on(&mut receiver, 0, 0);
        assert_eq!(acks, vec![SeqNum::from_raw(0)]);
        assert_eq!(delivered, vec![payload(0), payload(1), payload(2)]);
    }

    #[rstest]
    #[case::consumed(0)]
    #[case::buffered(2)]
    fn test_duplicates_are_reacked_but_not_redelivered(#[case] dup_seq: u16) {
        let mut receiver = receiver();
        on(&mut receiver, 0, 0);
        on(&mut receiver, 2, 2);

        let (acks, delivered) = on(&mut receiver, dup_seq, 99);
        assert!(delivered.is_empty());
        if dup_seq == 0 {
            // consumed duplicates are re-acked in case the original ack was lost
            assert_eq!(acks, vec![SeqNum::from_raw(0)]);
        }
        assert_eq!(receiver.stats().duplicates, 1);
    }

    #[test]
    fn test_beyond_window_is_dropped_without_ack() {
        let mut receiver = receiver();
        let (acks, delivered) = on(&mut receiver, W, 1);
        assert!(acks.is_empty());
        assert!(delivered.is_empty());
        assert_eq!(receiver.stats().out_of_window, 1);
    }

    #[test]
    fn test_delivery_across_the_wrap_point() {
        let mut receiver = receiver();
        for i in 0..SEQ_MODULUS {
            on(&mut receiver, i, i as u8);
        }

        let (_, delivered) = on(&mut receiver, 1, 7);
        assert!(delivered.is_empty());
        let (_, delivered) = on(&mut receiver, 0, 6);
        assert_eq!(delivered, vec![payload(6), payload(7)]);
    }
}
