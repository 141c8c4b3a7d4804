//! Timer min-heap (1-indexed, array-backed)
//!
//! Heap menyimpan slot index, setiap slot menyimpan posisinya di heap,
//! sehingga remove sembarang timer cukup O(log n).
//! Slot memakai generation counter: key lama tidak akan pernah
//! mengenai timer baru yang menempati slot yang sama.

use std::time::Instant;

/// Handle ke timer di dalam heap
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerKey {
    slot: u32,
    generation: u32,
}

struct Entry<T> {
    expiry: Instant,
    heap_pos: usize,
    payload: T,
}

struct Slot<T> {
    generation: u32,
    entry: Option<Entry<T>>,
}

/// Binary min-heap ordered by expiry
///
/// Timer dengan expiry sama keluar dalam urutan tidak tertentu.
pub struct TimerHeap<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    // heap[0] tidak dipakai
    heap: Vec<u32>,
}

impl<T> Default for TimerHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerHeap<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            heap: vec![u32::MAX],
        }
    }

    /// Jumlah timer aktif, O(1)
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.heap.len() - 1
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert timer baru sebagai leaf lalu adjust ke atas
    pub fn insert(&mut self, expiry: Instant, payload: T) -> TimerKey {
        let heap_pos = self.heap.len();
        let entry = Entry {
            expiry,
            heap_pos,
            payload,
        };

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize].entry = Some(entry);
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                (self.slots.len() - 1) as u32
            }
        };

        self.heap.push(slot);
        self.adjust(heap_pos);

        TimerKey {
            slot,
            generation: self.slots[slot as usize].generation,
        }
    }

    /// Remove timer dari posisi mana pun. Key basi menghasilkan `None`.
    pub fn remove(&mut self, key: TimerKey) -> Option<T> {
        let pos = self.entry(key)?.heap_pos;

        let last = self.heap.len() - 1;
        if pos != last {
            self.heap.swap(pos, last);
            self.set_pos(pos);
        }
        self.heap.pop();

        let slot = &mut self.slots[key.slot as usize];
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.slot);

        if pos < self.heap.len() {
            self.adjust(pos);
        }

        Some(entry.payload)
    }

    /// Ubah expiry timer yang masih aktif
    pub fn reschedule(&mut self, key: TimerKey, expiry: Instant) -> bool {
        let pos = match self.slots.get_mut(key.slot as usize) {
            Some(Slot {
                generation,
                entry: Some(entry),
            }) if *generation == key.generation => {
                entry.expiry = expiry;
                entry.heap_pos
            }
            _ => return false,
        };
        self.adjust(pos);
        true
    }

    /// Timer paling awal tanpa mengeluarkannya
    pub fn top(&self) -> Option<(TimerKey, Instant)> {
        let slot = *self.heap.get(1)?;
        let s = &self.slots[slot as usize];
        let entry = s.entry.as_ref()?;
        Some((
            TimerKey {
                slot,
                generation: s.generation,
            },
            entry.expiry,
        ))
    }

    /// Keluarkan timer paling awal
    pub fn pop(&mut self) -> Option<(TimerKey, Instant, T)> {
        let (key, expiry) = self.top()?;
        let payload = self.remove(key)?;
        Some((key, expiry, payload))
    }

    pub fn contains(&self, key: TimerKey) -> bool {
        self.entry(key).is_some()
    }

    fn entry(&self, key: TimerKey) -> Option<&Entry<T>> {
        let slot = self.slots.get(key.slot as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    #[inline(always)]
    fn expiry_at(&self, pos: usize) -> Instant {
        match &self.slots[self.heap[pos] as usize].entry {
            Some(entry) => entry.expiry,
            None => unreachable!("heap references an empty timer slot"),
        }
    }

    /// Sinkronkan `heap_pos` milik slot yang sekarang ada di `pos`
    #[inline(always)]
    fn set_pos(&mut self, pos: usize) {
        let slot = self.heap[pos] as usize;
        if let Some(entry) = self.slots[slot].entry.as_mut() {
            entry.heap_pos = pos;
        }
    }

    fn adjust(&mut self, pos: usize) {
        let parent = pos >> 1;
        if parent > 0 && self.expiry_at(pos) < self.expiry_at(parent) {
            self.sift_up(pos);
        } else {
            self.sift_down(pos);
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 1 {
            let parent = pos >> 1;
            if self.expiry_at(pos) >= self.expiry_at(parent) {
                break;
            }
            self.heap.swap(pos, parent);
            self.set_pos(pos);
            self.set_pos(parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.len();
        loop {
            let left = pos << 1;
            let right = left + 1;
            let mut min = pos;

            if left <= len && self.expiry_at(left) < self.expiry_at(min) {
                min = left;
            }
            if right <= len && self.expiry_at(right) < self.expiry_at(min) {
                min = right;
            }
            if min == pos {
                break;
            }
            self.heap.swap(pos, min);
            self.set_pos(pos);
            self.set_pos(min);
            pos = min;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn test_pop_order_nondecreasing() {
        let base = Instant::now();
        let mut heap = TimerHeap::new();

        // pseudo-random expiries (LCG)
        let mut x = 12345u64;
        for i in 0..500u32 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            heap.insert(at(base, (x >> 33) % 10_000), i);
        }
        assert_eq!(heap.len(), 500);

        let mut last = base;
        let mut count = 0;
        while let Some((_, expiry, _)) = heap.pop() {
            assert!(expiry >= last);
            last = expiry;
            count += 1;
        }
        assert_eq!(count, 500);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_remove_arbitrary() {
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        let keys: Vec<_> = (0..100u64).map(|i| heap.insert(at(base, (i * 37) % 101), i)).collect();

        let mut removed = 0;
        for key in keys.iter().step_by(3) {
            assert!(heap.remove(*key).is_some());
            removed += 1;
        }
        assert_eq!(heap.len(), 100 - removed);

        // remove dua kali -> None
        assert!(heap.remove(keys[0]).is_none());

        let mut last = base;
        while let Some((key, expiry, _)) = heap.pop() {
            assert!(expiry >= last);
            assert!(!keys.iter().step_by(3).any(|k| *k == key));
            last = expiry;
        }
    }

    #[test]
    fn test_stale_key_after_slot_reuse() {
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        let old = heap.insert(at(base, 10), "old");
        assert_eq!(heap.remove(old), Some("old"));

        let new = heap.insert(at(base, 20), "new");
        assert_ne!(old, new);
        assert!(heap.remove(old).is_none());
        assert!(heap.contains(new));
        assert_eq!(heap.top().map(|(k, _)| k), Some(new));
    }

    #[test]
    fn test_reschedule_moves_both_directions() {
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        let a = heap.insert(at(base, 10), 'a');
        let b = heap.insert(at(base, 20), 'b');
        let c = heap.insert(at(base, 30), 'c');

        assert!(heap.reschedule(c, at(base, 5)));
        assert_eq!(heap.top().map(|(k, _)| k), Some(c));

        assert!(heap.reschedule(c, at(base, 50)));
        assert_eq!(heap.top().map(|(k, _)| k), Some(a));

        let order: Vec<char> = std::iter::from_fn(|| heap.pop().map(|(_, _, v)| v)).collect();
        assert_eq!(order, vec!['a', 'b', 'c']);
        assert!(!heap.reschedule(b, base));
    }
}
