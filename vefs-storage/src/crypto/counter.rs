//! 128-bit little-endian nonce counters.

use parking_lot::Mutex;

/// A 128-bit counter value. Serialized little-endian; incremented before
/// every use so a value is never issued twice within an archive session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct Counter(u128);

impl Counter {
    pub const ZERO: Counter = Counter(0);

    pub const fn from_le_bytes(bytes: [u8; 16]) -> Self {
        Counter(u128::from_le_bytes(bytes))
    }

    pub const fn to_le_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    #[must_use]
    pub const fn incremented(self) -> Self {
        Counter(self.0.wrapping_add(1))
    }
}

/// Shared-state counter handing out unique values to concurrent writers.
#[derive(Debug, Default)]
pub struct AtomicCounter(Mutex<Counter>);

impl AtomicCounter {
    pub fn new(value: Counter) -> Self {
        AtomicCounter(Mutex::new(value))
    }

    pub fn load(&self) -> Counter {
        *self.0.lock()
    }

    pub fn store(&self, value: Counter) {
        *self.0.lock() = value;
    }

    /// Returns the current value and advances the counter.
    pub fn fetch_increment(&self) -> Counter {
        let mut guard = self.0.lock();
        let current = *guard;
        *guard = current.incremented();
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_increment_returns_pre_increment_value() {
        let ctr = AtomicCounter::new(Counter::from_le_bytes([0xff; 16]));
        let first = ctr.fetch_increment();
        assert_eq!(first.to_le_bytes(), [0xff; 16]);
        assert_ne!(ctr.load(), first);
    }

    #[test]
    fn increment_carries_across_limbs() {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&u64::MAX.to_le_bytes());
        let next = Counter::from_le_bytes(bytes).incremented();
        let mut expected = [0u8; 16];
        expected[8] = 1;
        assert_eq!(next.to_le_bytes(), expected);
    }
}
