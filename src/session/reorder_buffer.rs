use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::trace;
use crate::packet::packet::Packet;
use crate::packet::sequence::SequenceNumber;

enum Slot {
    Missing {
        nacks: u32,
        last_nack: Option<Instant>,
    },
    Received(Packet),
}

#[derive(Debug)]
pub enum ReceiveOutcome {
    /// the packet was delivered before or is already buffered
    Duplicate,
    Accepted {
        /// packets that became deliverable, in sequence order
        delivered: Vec<Packet>,
        /// sequence numbers of gaps that were detected with this packet
        newly_missing: Vec<SequenceNumber>,
    },
    /// the packet is too far ahead of the next expected sequence number
    WindowExceeded,
}

/// Holds data packets received out of sequence until the gap before them is filled, and
///  keeps track of NACKs sent for the missing packets.
///
/// `slots[i]` corresponds to sequence number `next_expected + i`, so the first slot is always
///  missing (received packets at the front are delivered right away)
pub struct ReorderBuffer {
    next_expected: SequenceNumber,
    slots: VecDeque<Slot>,
    window: u16,
}

impl ReorderBuffer {
    pub fn new(window: u16) -> ReorderBuffer {
        Self::starting_at(SequenceNumber::ZERO, window)
    }

    pub fn starting_at(next_expected: SequenceNumber, window: u16) -> ReorderBuffer {
        assert!(window > 0 && window <= i16::MAX as u16);
        ReorderBuffer {
            next_expected,
            slots: Default::default(),
            window,
        }
    }

    pub fn next_expected(&self) -> SequenceNumber {
        self.next_expected
    }

    /// The highest sequence number that was delivered in sequence, i.e. the value to
    ///  acknowledge
    pub fn last_delivered(&self) -> SequenceNumber {
        self.next_expected.prev()
    }

    /// number of packets received out of sequence and waiting for a gap to be filled
    pub fn num_buffered(&self) -> usize {
        self.slots.iter()
            .filter(|s| matches!(s, Slot::Received(_)))
            .count()
    }

    pub fn missing(&self) -> Vec<SequenceNumber> {
        self.slots.iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Slot::Missing { .. }))
            .map(|(i, _)| self.sequence_at(i))
            .collect()
    }

    pub fn on_packet(&mut self, packet: Packet) -> ReceiveOutcome {
        let offset = packet.sequence().distance_from(self.next_expected);
        if offset < 0 {
            trace!("packet {} was delivered before", packet.sequence());
            return ReceiveOutcome::Duplicate;
        }

        let offset = offset as usize;
        if offset >= self.window as usize {
            return ReceiveOutcome::WindowExceeded;
        }

        let mut newly_missing = Vec::new();
        if offset < self.slots.len() {
            if let Slot::Received(_) = self.slots[offset] {
                trace!("packet {} is already buffered", packet.sequence());
                return ReceiveOutcome::Duplicate;
            }
            self.slots[offset] = Slot::Received(packet);
        }
        else {
            for i in self.slots.len()..offset {
                newly_missing.push(self.sequence_at(i));
                self.slots.push_back(Slot::Missing { nacks: 0, last_nack: None });
            }
            self.slots.push_back(Slot::Received(packet));
        }

        let mut delivered = Vec::new();
        while let Some(Slot::Received(_)) = self.slots.front() {
            if let Some(Slot::Received(p)) = self.slots.pop_front() {
                delivered.push(p);
            }
            self.next_expected = self.next_expected.next();
        }

        ReceiveOutcome::Accepted {
            delivered,
            newly_missing,
        }
    }

    /// Records that a NACK was sent for a sequence number. Returns `false` if the packet is not
    ///  missing (anymore), i.e. there is no need to send the NACK.
    pub fn record_nack(&mut self, sequence: SequenceNumber, now: Instant) -> bool {
        let offset = sequence.distance_from(self.next_expected);
        if offset < 0 || offset as usize >= self.slots.len() {
            return false;
        }

        match &mut self.slots[offset as usize] {
            Slot::Missing { nacks, last_nack } => {
                *nacks += 1;
                *last_nack = Some(now);
                true
            }
            Slot::Received(_) => false,
        }
    }

    /// Returns the missing sequence numbers that were NACK'ed at least `retry_interval` ago and
    ///  should be NACK'ed again, or `Err` with the first missing sequence number that was
    ///  NACK'ed `max_nacks` times without being filled.
    pub fn overdue_nacks(&self, now: Instant, retry_interval: Duration, max_nacks: u32) -> Result<Vec<SequenceNumber>, SequenceNumber> {
        let mut result = Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            if let Slot::Missing { nacks, last_nack: Some(last_nack) } = slot {
                if now.duration_since(*last_nack) < retry_interval {
                    continue;
                }
                if *nacks >= max_nacks {
                    return Err(self.sequence_at(i));
                }
                result.push(self.sequence_at(i));
            }
        }
        Ok(result)
    }

    fn sequence_at(&self, offset: usize) -> SequenceNumber {
        self.next_expected.wrapping_add(offset as u16)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use rstest::rstest;
    use super::*;

    fn packet(seq: u16) -> Packet {
        Packet::data(SequenceNumber::from_raw(seq), Bytes::from(seq.to_be_bytes().to_vec()))
    }

    fn delivered_seqs(outcome: ReceiveOutcome) -> Vec<u16> {
        match outcome {
            ReceiveOutcome::Accepted { delivered, .. } => delivered.iter().map(|p| p.sequence().to_raw()).collect(),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_in_order() {
        let mut buffer = ReorderBuffer::new(100);
        assert_eq!(delivered_seqs(buffer.on_packet(packet(0))), vec![0]);
        assert_eq!(delivered_seqs(buffer.on_packet(packet(1))), vec![1]);
        assert_eq!(buffer.next_expected(), SequenceNumber::from_raw(2));
        assert_eq!(buffer.last_delivered(), SequenceNumber::from_raw(1));
    }

    #[test]
    fn test_gap() {
        let mut buffer = ReorderBuffer::new(100);
        assert_eq!(delivered_seqs(buffer.on_packet(packet(0))), vec![0]);

        match buffer.on_packet(packet(3)) {
            ReceiveOutcome::Accepted { delivered, newly_missing } => {
                assert!(delivered.is_empty());
                assert_eq!(newly_missing, vec![SequenceNumber::from_raw(1), SequenceNumber::from_raw(2)]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(buffer.num_buffered(), 1);
        assert_eq!(buffer.missing(), vec![SequenceNumber::from_raw(1), SequenceNumber::from_raw(2)]);

        assert_eq!(delivered_seqs(buffer.on_packet(packet(2))), Vec::<u16>::new());
        assert_eq!(delivered_seqs(buffer.on_packet(packet(1))), vec![1, 2, 3]);
        assert_eq!(buffer.num_buffered(), 0);
        assert!(buffer.missing().is_empty());
    }

    #[rstest]
    #[case::delivered(0)]
    #[case::buffered(5)]
    fn test_duplicate(#[case] duplicate: u16) {
        let mut buffer = ReorderBuffer::new(100);
        let _ = buffer.on_packet(packet(0));
        let _ = buffer.on_packet(packet(5));

        assert!(matches!(buffer.on_packet(packet(duplicate)), ReceiveOutcome::Duplicate));
    }

    #[test]
    fn test_window_exceeded() {
        let mut buffer = ReorderBuffer::starting_at(SequenceNumber::from_raw(65500), 100);
        assert!(matches!(buffer.on_packet(packet(65500u16.wrapping_add(100))), ReceiveOutcome::WindowExceeded));
        assert!(matches!(buffer.on_packet(packet(65500u16.wrapping_add(99))), ReceiveOutcome::Accepted { .. }));
    }

    #[rstest]
    #[case::from_zero(0, 1)]
    #[case::across_wrap(65530, 2)]
    #[case::across_wrap_other_seed(65500, 3)]
    fn test_any_permutation_is_delivered_in_order(#[case] first: u16, #[case] seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);

        for _ in 0..50 {
            let mut arrivals = (0..40u16).map(|i| first.wrapping_add(i)).collect::<Vec<_>>();
            arrivals.shuffle(&mut rng);
            // some duplicates
            let dups = arrivals[..5].to_vec();
            arrivals.extend(dups);

            let mut buffer = ReorderBuffer::starting_at(SequenceNumber::from_raw(first), 1000);
            let mut delivered = Vec::new();
            for seq in arrivals {
                if let ReceiveOutcome::Accepted { delivered: d, .. } = buffer.on_packet(packet(seq)) {
                    delivered.extend(d.into_iter().map(|p| p.sequence()));
                }
            }

            let expected = (0..40u16).map(|i| SequenceNumber::from_raw(first.wrapping_add(i))).collect::<Vec<_>>();
            assert_eq!(delivered, expected);
            assert_eq!(buffer.num_buffered(), 0);
        }
    }

    #[test]
    fn test_nack_bookkeeping() {
        let t0 = Instant::now();
        let retry = Duration::from_millis(100);

        let mut buffer = ReorderBuffer::new(100);
        let _ = buffer.on_packet(packet(2));

        // not nacked yet
        assert_eq!(buffer.overdue_nacks(t0 + retry, retry, 2), Ok(vec![]));

        assert!(buffer.record_nack(SequenceNumber::from_raw(0), t0));
        assert!(buffer.record_nack(SequenceNumber::from_raw(1), t0));
        assert!(!buffer.record_nack(SequenceNumber::from_raw(2), t0));
        assert!(!buffer.record_nack(SequenceNumber::from_raw(3), t0));

        assert_eq!(buffer.overdue_nacks(t0 + Duration::from_millis(50), retry, 2), Ok(vec![]));
        assert_eq!(buffer.overdue_nacks(t0 + retry, retry, 2), Ok(vec![SequenceNumber::from_raw(0), SequenceNumber::from_raw(1)]));

        let _ = buffer.on_packet(packet(0));
        assert!(buffer.record_nack(SequenceNumber::from_raw(1), t0 + retry));
        assert_eq!(buffer.overdue_nacks(t0 + 2*retry, retry, 2), Err(SequenceNumber::from_raw(1)));

        let _ = buffer.on_packet(packet(1));
        assert_eq!(buffer.overdue_nacks(t0 + 10*retry, retry, 2), Ok(vec![]));
        assert_eq!(buffer.next_expected(), SequenceNumber::from_raw(3));
    }
}
