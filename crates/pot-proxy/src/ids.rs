//! Transaction id allocation.

use std::sync::Mutex;

use pot_wire::TransactionId;

/// Monotonic id source shared by one request relay.
///
/// Wraps to zero past the 32-bit boundary. Collisions with long-outstanding
/// transactions are resolved by the pending table, which keeps drawing until
/// a free slot turns up.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: Mutex<u32>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts counting at `value`; used to exercise wrap behavior.
    pub fn starting_at(value: u32) -> Self {
        Self {
            next: Mutex::new(value),
        }
    }

    /// Returns the next id.
    pub fn next(&self) -> TransactionId {
        let mut next = self.next.lock().expect("id allocator lock poisoned");
        let id = *next;
        *next = next.wrapping_add(1);
        TransactionId::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_up_from_zero() {
        let ids = IdAllocator::new();
        assert_eq!(ids.next(), TransactionId::new(0));
        assert_eq!(ids.next(), TransactionId::new(1));
        assert_eq!(ids.next(), TransactionId::new(2));
    }

    #[test]
    fn wraps_at_the_32_bit_boundary() {
        let ids = IdAllocator::starting_at(u32::MAX);
        assert_eq!(ids.next(), TransactionId::new(u32::MAX));
        assert_eq!(ids.next(), TransactionId::new(0));
    }
}
