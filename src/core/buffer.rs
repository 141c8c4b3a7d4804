//! Growable byte buffer dengan sliding window `[start, end)`
//!
//! Dipakai untuk inbound/outbound data pada Stream.
//! Append di ekor, erase di kepala, compact sebelum realloc.

/// Kapasitas awal (16 KiB)
pub const BASE_CAPACITY: usize = 16 * 1024;

/// Buffer >= 1 MiB yang isinya < 16 KiB dikecilkan kembali ke `BASE_CAPACITY`
pub const SHRINK_THRESHOLD: usize = 1024 * 1024;

/// Growable buffer
///
/// Invariant: `0 <= start <= end <= capacity`.
#[derive(Debug)]
pub struct Buffer {
    storage: Box<[u8]>,
    start: usize,
    end: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Buffer kosong dengan kapasitas 16 KiB
    pub fn new() -> Self {
        Self::with_capacity(BASE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    /// Jumlah byte yang belum di-erase
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Live bytes (zero-copy)
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.storage[self.start..self.end]
    }

    /// Pastikan ada minimal `additional` byte kosong di ekor.
    ///
    /// Urutan: cukup di ekor -> selesai; cukup kalau di-compact -> compact;
    /// selain itu realloc ke persis `len + additional`.
    pub fn reserve(&mut self, additional: usize) {
        if self.capacity() - self.end >= additional {
            return;
        }

        let len = self.len();
        if self.capacity() - self.end + self.start >= additional {
            self.storage.copy_within(self.start..self.end, 0);
        } else {
            let mut grown = vec![0u8; len + additional].into_boxed_slice();
            grown[..len].copy_from_slice(self.data());
            self.storage = grown;
        }
        self.start = 0;
        self.end = len;
    }

    /// Copy `bytes` ke ekor buffer
    #[inline]
    pub fn append(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.storage[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
    }

    /// Free tail untuk zero-copy read dari socket; commit dengan `seek`
    #[inline(always)]
    pub fn space_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.end..]
    }

    /// Commit `n` byte yang sudah ditulis ke `space_mut()`
    #[inline(always)]
    pub fn seek(&mut self, n: usize) {
        self.end = (self.end + n).min(self.capacity());
    }

    /// Buang `n` byte dari kepala buffer
    pub fn erase(&mut self, n: usize) {
        self.start += n.min(self.len());

        if self.capacity() >= SHRINK_THRESHOLD && self.len() < BASE_CAPACITY {
            let len = self.len();
            let mut smaller = vec![0u8; BASE_CAPACITY].into_boxed_slice();
            smaller[..len].copy_from_slice(self.data());
            self.storage = smaller;
            self.start = 0;
            self.end = len;
        }
    }

    /// Kosongkan tanpa mengubah kapasitas
    #[inline]
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_erase_accounting() {
        let mut buf = Buffer::new();
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.data(), b"hello world");

        buf.erase(6);
        assert_eq!(buf.data(), b"world");

        buf.append(b"!");
        assert_eq!(buf.data(), b"world!");
        assert_eq!(buf.len(), 6);

        // erase lebih dari isi
        buf.erase(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reserve_compacts_before_growing() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[1u8; 12]);
        buf.erase(10);
        // tail = 4, tail + head = 14
        buf.reserve(10);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.data(), &[1u8, 1]);
        assert!(buf.space_mut().len() >= 10);
    }

    #[test]
    fn test_reserve_grows_to_exact_fit() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"abcdef");
        buf.reserve(20);
        assert_eq!(buf.capacity(), 26);
        assert_eq!(buf.data(), b"abcdef");
    }

    #[test]
    fn test_space_and_seek() {
        let mut buf = Buffer::new();
        let space = buf.space_mut();
        space[..3].copy_from_slice(b"abc");
        buf.seek(3);
        assert_eq!(buf.data(), b"abc");

        // seek tidak boleh melewati kapasitas
        buf.seek(usize::MAX / 2);
        assert_eq!(buf.len(), buf.capacity());
    }

    #[test]
    fn test_shrink_after_large_burst() {
        let mut buf = Buffer::new();
        let big = vec![7u8; 2 * SHRINK_THRESHOLD];
        buf.append(&big);
        assert!(buf.capacity() >= SHRINK_THRESHOLD);

        buf.erase(big.len() - 100);
        assert_eq!(buf.capacity(), BASE_CAPACITY);
        assert_eq!(buf.len(), 100);
        assert!(buf.data().iter().all(|&b| b == 7));
    }

    #[test]
    fn test_order_preserved_over_many_cycles() {
        let mut buf = Buffer::with_capacity(32);
        let mut expected = Vec::new();
        let mut next = 0u8;

        for round in 0..200usize {
            let chunk: Vec<u8> = (0..(round % 13) + 1)
                .map(|_| {
                    next = next.wrapping_add(1);
                    next
                })
                .collect();
            buf.append(&chunk);
            expected.extend_from_slice(&chunk);

            let drop = round % 7;
            buf.erase(drop);
            expected.drain(..drop.min(expected.len()));

            assert_eq!(buf.data(), expected.as_slice());
        }
    }
}
