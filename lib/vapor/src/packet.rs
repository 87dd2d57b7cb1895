/// A byte buffer with an adjustable data window, so protocol layers can strip
/// headers on the way up and reclaim headroom for new headers on the way down
/// without copying.
///
/// The window is `[head, head + len)` over the owned storage. `strip` narrows
/// it from the front, `unstrip` widens it back out, `extend`/`truncate` adjust
/// the tail. All window moves panic when they leave the storage; callers size
/// packets from the MTU up front.
pub struct Packet {
    data: Vec<u8>,
    head: usize,
    len: usize,
}

impl Packet {
    /// New packet with `headroom` reserved bytes in front of an empty window
    /// that can grow up to `capacity` bytes.
    #[inline]
    pub fn new(headroom: usize, capacity: usize) -> Packet {
        Packet {
            data: vec![0u8; headroom + capacity],
            head: headroom,
            len: 0,
        }
    }

    /// Resets the window to cover all storage past `headroom`.
    #[inline]
    pub fn reset(&mut self, headroom: usize) {
        if headroom > self.data.len() {
            panic!("Headroom {} exceeds storage {}", headroom, self.data.len());
        }
        self.head = headroom;
        self.len = self.data.len() - headroom;
    }

    /// Current window length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Bytes available in front of the window.
    #[inline]
    pub fn headroom(&self) -> usize {
        self.head
    }

    /// Bytes available behind the window.
    #[inline]
    pub fn tailroom(&self) -> usize {
        self.data.len() - self.head - self.len
    }

    /// The data window.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[self.head..self.head + self.len]
    }

    /// The data window, mutable.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head..self.head + self.len]
    }

    /// Narrows the window by `count` bytes from the front (header removal).
    #[inline]
    pub fn strip(&mut self, count: usize) {
        if count > self.len {
            panic!("Stripping {} bytes off a {} byte window", count, self.len);
        }
        self.head += count;
        self.len -= count;
    }

    /// Widens the window by `count` bytes at the front (header prepend); the
    /// exposed bytes keep whatever content the storage held.
    #[inline]
    pub fn unstrip(&mut self, count: usize) {
        if count > self.head {
            panic!("Unstripping {} bytes with {} headroom", count, self.head);
        }
        self.head -= count;
        self.len += count;
    }

    /// Sets the window length.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        if self.head + len > self.data.len() {
            panic!("Window of {} bytes exceeds storage", len);
        }
        self.len = len;
    }

    /// Grows the window by `count` bytes at the tail and returns the newly
    /// exposed slice.
    #[inline]
    pub fn extend(&mut self, count: usize) -> &mut [u8] {
        if count > self.tailroom() {
            panic!("Extending {} bytes with {} tailroom", count, self.tailroom());
        }
        self.len += count;
        let end = self.head + self.len;
        &mut self.data[end - count..end]
    }

    /// Shrinks the window to `len` bytes, dropping the tail.
    #[inline]
    pub fn truncate(&mut self, len: usize) {
        if len > self.len {
            panic!("Truncating a {} byte window to {}", self.len, len);
        }
        self.len = len;
    }

    /// Replaces the window content (resized to fit), keeping the current head.
    #[inline]
    pub fn fill(&mut self, content: &[u8]) {
        if self.head + content.len() > self.data.len() {
            panic!("Content of {} bytes exceeds storage", content.len());
        }
        self.len = content.len();
        self.data_mut().copy_from_slice(content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_unstrip_roundtrip() {
        let mut pkt = Packet::new(40, 100);
        pkt.fill(b"payload");

        pkt.unstrip(40);
        assert_eq!(pkt.len(), 47);
        assert_eq!(pkt.headroom(), 0);

        pkt.strip(40);
        assert_eq!(pkt.data(), b"payload");
    }

    #[test]
    fn test_extend_exposes_tail() {
        let mut pkt = Packet::new(0, 16);
        pkt.fill(b"abc");

        let tail = pkt.extend(2);
        tail.copy_from_slice(b"de");

        assert_eq!(pkt.data(), b"abcde");

        pkt.truncate(3);
        assert_eq!(pkt.data(), b"abc");
    }

    #[test]
    fn test_reset_opens_full_window() {
        let mut pkt = Packet::new(8, 24);
        pkt.fill(b"xyz");
        pkt.strip(1);

        pkt.reset(8);
        assert_eq!(pkt.len(), 24);
        assert_eq!(pkt.headroom(), 8);
    }

    #[test]
    #[should_panic(expected = "Stripping 4 bytes off a 3 byte window")]
    fn test_strip_past_window_panics() {
        let mut pkt = Packet::new(0, 8);
        pkt.fill(b"abc");
        pkt.strip(4);
    }

    #[test]
    #[should_panic(expected = "Unstripping 1 bytes with 0 headroom")]
    fn test_unstrip_past_storage_panics() {
        let mut pkt = Packet::new(0, 8);
        pkt.unstrip(1);
    }
}
