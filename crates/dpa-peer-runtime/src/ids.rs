use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Hop-by-Hop and End-to-End identifier source (RFC 6733 Sec 3).
///
/// Hop-by-Hop starts at a random value; End-to-End starts with the low
/// 12 bits of the current time in the high bits and a random low part.
/// Both increase monotonically and wrap.
#[derive(Debug)]
pub struct IdGenerator {
    hop_by_hop: AtomicU32,
    end_to_end: AtomicU32,
}

impl IdGenerator {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let high = ((secs & 0xFFF) as u32) << 20;
        let low = rng.random::<u32>() & 0x000F_FFFF;

        Self {
            hop_by_hop: AtomicU32::new(rng.random()),
            end_to_end: AtomicU32::new(high | low),
        }
    }

    pub fn next_hop_by_hop(&self) -> u32 {
        self.hop_by_hop.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_end_to_end(&self) -> u32 {
        self.end_to_end.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_sequential() {
        let ids = IdGenerator::new();
        let first = ids.next_hop_by_hop();
        assert_eq!(ids.next_hop_by_hop(), first.wrapping_add(1));

        let e2e = ids.next_end_to_end();
        assert_eq!(ids.next_end_to_end(), e2e.wrapping_add(1));
    }
}
