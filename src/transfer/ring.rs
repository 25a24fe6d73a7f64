//! Fixed-capacity table of in-flight chunks.
//!
//! A slot borrows its chunk from the blob being sent, so the ring cannot
//! outlive the blob. Slots are reused only once their previous occupant was
//! acknowledged (or never assigned).

use super::timer::TimerHandle;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Init,
    Sent,
    Resending,
    Acked,
}

impl SlotState {
    pub fn is_free(self) -> bool {
        matches!(self, SlotState::Init | SlotState::Acked)
    }

    pub fn in_flight(self) -> bool {
        matches!(self, SlotState::Sent | SlotState::Resending)
    }
}

#[derive(Debug)]
pub struct Slot<'a> {
    pub sequence: u32,
    pub request_id: u8,
    pub frame_id: u8,
    pub data: &'a [u8],
    pub state: SlotState,
    /// Transmissions so far for the current occupant.
    pub attempt: u32,
    pub sent_at: Option<Instant>,
    pending_timer: Option<TimerHandle>,
}

impl<'a> Slot<'a> {
    fn empty() -> Self {
        Self {
            sequence: 0,
            request_id: 0,
            frame_id: 0,
            data: &[],
            state: SlotState::Init,
            attempt: 0,
            sent_at: None,
            pending_timer: None,
        }
    }

    pub fn holds(&self, request_id: u8, sequence: u32) -> bool {
        self.state != SlotState::Init && self.request_id == request_id && self.sequence == sequence
    }

    pub fn has_timer(&self) -> bool {
        self.pending_timer.is_some()
    }
}

/// Result of applying a data ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMatch {
    Acked(usize),
    Duplicate,
    Stale,
}

#[derive(Debug)]
pub struct TransmitRing<'a> {
    slots: Vec<Slot<'a>>,
}

impl<'a> TransmitRing<'a> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| Slot::empty()).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, idx: usize) -> &Slot<'a> {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut Slot<'a> {
        &mut self.slots[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot<'a>> {
        self.slots.iter()
    }

    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.state.in_flight()).count()
    }

    /// Free slot for `sequence`: its natural index first, then a backward
    /// scan around the ring.
    pub fn acquire(&self, sequence: u32) -> Option<usize> {
        let n = self.slots.len();
        let natural = sequence as usize % n;
        (0..n)
            .map(|step| (natural + n - step) % n)
            .find(|&idx| self.slots[idx].state.is_free())
    }

    /// Occupy a free slot. The previous occupant must have been acked.
    pub fn assign(&mut self, idx: usize, request_id: u8, sequence: u32, data: &'a [u8]) {
        let slot = &mut self.slots[idx];
        debug_assert!(slot.state.is_free(), "slot {} reassigned while in flight", idx);
        if let Some(t) = slot.pending_timer.take() {
            t.cancel();
        }
        *slot = Slot {
            sequence,
            request_id,
            data,
            ..Slot::empty()
        };
    }

    /// Slot currently holding (request_id, sequence), if any.
    pub fn find(&self, request_id: u8, sequence: u32) -> Option<usize> {
        let n = self.slots.len();
        let natural = sequence as usize % n;
        if self.slots[natural].holds(request_id, sequence) {
            return Some(natural);
        }
        self.slots.iter().position(|s| s.holds(request_id, sequence))
    }

    pub fn find_by_frame_id(&self, frame_id: u8) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.state.in_flight() && s.frame_id == frame_id)
    }

    /// Mark acknowledged. The pending timer, if any, is handed back so the
    /// caller can cancel it and log the outcome.
    pub fn ack(&mut self, request_id: u8, sequence: u32) -> (AckMatch, Option<TimerHandle>) {
        match self.find(request_id, sequence) {
            None => (AckMatch::Stale, None),
            Some(idx) if self.slots[idx].state == SlotState::Acked => (AckMatch::Duplicate, None),
            Some(idx) => {
                let slot = &mut self.slots[idx];
                slot.state = SlotState::Acked;
                (AckMatch::Acked(idx), slot.pending_timer.take())
            }
        }
    }

    pub fn set_timer(&mut self, idx: usize, timer: TimerHandle) -> Option<TimerHandle> {
        self.slots[idx].pending_timer.replace(timer)
    }

    pub fn take_timer(&mut self, idx: usize) -> Option<TimerHandle> {
        self.slots[idx].pending_timer.take()
    }

    /// Cancel every outstanding timer; used when a transfer ends.
    pub fn cancel_all_timers(&mut self) -> usize {
        let mut n = 0;
        for slot in self.slots.iter_mut() {
            if let Some(t) = slot.pending_timer.take() {
                t.cancel();
                n += 1;
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_index_then_backward_scan() {
        let data = [0u8; 4];
        let mut ring = TransmitRing::new(4);
        assert_eq!(ring.acquire(6), Some(2));
        ring.assign(2, 1, 2, &data);
        ring.slot_mut(2).state = SlotState::Sent;
        // 6 mod 4 is busy: scan backward to 1.
        assert_eq!(ring.acquire(6), Some(1));
        for idx in [0, 1, 3] {
            ring.assign(idx, 1, idx as u32, &data);
            ring.slot_mut(idx).state = SlotState::Resending;
        }
        assert_eq!(ring.acquire(6), None);
        assert_eq!(ring.in_flight(), 4);
    }

    #[test]
    fn ack_for_previous_occupant_is_stale() {
        let data = [1u8, 2, 3];
        let mut ring = TransmitRing::new(24);
        let idx = ring.acquire(9).unwrap();
        ring.assign(idx, 3, 9, &data);
        ring.slot_mut(idx).state = SlotState::Sent;
        assert!(matches!(ring.ack(3, 9), (AckMatch::Acked(i), None) if i == idx));
        assert!(matches!(ring.ack(3, 9), (AckMatch::Duplicate, None)));

        // Same slot now belongs to request 4.
        ring.assign(idx, 4, 9, &data);
        ring.slot_mut(idx).state = SlotState::Sent;
        assert!(matches!(ring.ack(3, 9), (AckMatch::Stale, None)));
        assert_eq!(ring.slot(idx).state, SlotState::Sent);
        assert_eq!(ring.slot(idx).request_id, 4);
    }

    #[test]
    fn unassigned_slot_never_matches() {
        let ring = TransmitRing::new(8);
        assert_eq!(ring.find(0, 0), None);
        assert_eq!(ring.find_by_frame_id(0), None);
    }
}
