//! Per-frame-slot bookkeeping lists.

/// Where work deferred right now should be parked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotTarget {
    /// The open frame's slot.
    Slot(usize),
    /// No frame is open; the next slot to begin adopts the entry.
    Carry,
}

/// One list per frame slot, plus a carry list for entries deferred while no
/// frame is open.
///
/// Carried entries are adopted after the adopting slot has been reclaimed, so
/// they always wait for one full retirement of that slot.
#[derive(Debug)]
pub struct PerSlot<T> {
    slots: Vec<Vec<T>>,
    carry: Vec<T>,
}

impl<T> PerSlot<T> {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: (0..slot_count).map(|_| Vec::new()).collect(),
            carry: Vec::new(),
        }
    }

    pub fn push(&mut self, target: SlotTarget, item: T) {
        match target {
            SlotTarget::Slot(slot) => self.slots[slot].push(item),
            SlotTarget::Carry => self.carry.push(item),
        }
    }

    /// Removes and returns everything parked in `slot`.
    pub fn take_slot(&mut self, slot: usize) -> Vec<T> {
        std::mem::take(&mut self.slots[slot])
    }

    /// Moves carried entries into `slot`.
    pub fn adopt_carry(&mut self, slot: usize) -> usize {
        let adopted = self.carry.len();
        self.slots[slot].append(&mut self.carry);
        adopted
    }

    pub fn slot(&self, slot: usize) -> &[T] {
        &self.slots[slot]
    }

    /// Every parked entry, slots first, then the carry list.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().flatten().chain(&self.carry)
    }

    /// Total number of parked entries.
    pub fn len(&self) -> usize {
        self.slots.iter().map(Vec::len).sum::<usize>() + self.carry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry from every slot and the carry list.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut all = std::mem::take(&mut self.carry);
        for slot in &mut self.slots {
            all.append(slot);
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_take() {
        let mut lists = PerSlot::new(2);
        lists.push(SlotTarget::Slot(0), 'a');
        lists.push(SlotTarget::Slot(1), 'b');
        lists.push(SlotTarget::Slot(0), 'c');

        assert_eq!(lists.len(), 3);
        assert_eq!(lists.iter().count(), 3);
        assert_eq!(lists.take_slot(0), vec!['a', 'c']);
        assert!(lists.slot(0).is_empty());
        assert_eq!(lists.slot(1), &['b']);
    }

    #[test]
    fn test_carry_is_adopted_by_one_slot() {
        let mut lists = PerSlot::new(3);
        lists.push(SlotTarget::Carry, 1);
        lists.push(SlotTarget::Carry, 2);

        assert_eq!(lists.adopt_carry(2), 2);
        assert_eq!(lists.adopt_carry(0), 0);
        assert_eq!(lists.slot(2), &[1, 2]);
    }

    #[test]
    fn test_drain_all() {
        let mut lists = PerSlot::new(2);
        lists.push(SlotTarget::Slot(1), 1);
        lists.push(SlotTarget::Carry, 2);
        let mut all = lists.drain_all();
        all.sort();
        assert_eq!(all, vec![1, 2]);
        assert!(lists.is_empty());
    }
}
