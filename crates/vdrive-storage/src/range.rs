/// A half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        // Reversed ranges are allowed and treated as empty.
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversed_ranges_are_empty() {
        let r = ByteRange::new(10, 5);
        assert!(r.is_empty());
        assert_eq!(r.len(), 0);
    }

    #[test]
    fn len_counts_bytes_in_the_range() {
        let r = ByteRange::new(4096, 8192);
        assert!(!r.is_empty());
        assert_eq!(r.len(), 4096);
        assert!(ByteRange::new(7, 7).is_empty());
    }
}
