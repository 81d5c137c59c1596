//! Packet identifier allocation

/// Sequential 16-bit packet identifiers: 1, 2, ..., 65535, 1, ...
///
/// Zero is never handed out.
#[derive(Debug, Clone)]
pub struct PacketIdAllocator {
    next: u16,
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = if id == u16::MAX { 1 } else { id + 1 };
        id
    }

    pub fn reset(&mut self) {
        self.next = 1;
    }
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle_wraps_to_one() {
        let mut ids = PacketIdAllocator::new();
        for expected in 1..=u16::MAX {
            assert_eq!(ids.next_id(), expected);
        }
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn test_reset_restarts_at_one() {
        let mut ids = PacketIdAllocator::new();
        ids.next_id();
        ids.next_id();
        ids.reset();
        assert_eq!(ids.next_id(), 1);
    }
}
