//! Connection identifiers — collision-resistant 31-bit ids.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identifier of one live WebSocket connection.
///
/// Always a strictly positive 31-bit value: the high bit is kept clear so
/// the id stays positive when a host stores it signed, and the values 0 and
/// 1 are reserved as "no connection" sentinels and never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Generate a fresh identifier.
    ///
    /// Folds several entropy sources through a djb2 hash: a high-resolution
    /// timestamp, the coarse unix time, a hash of the process/installation
    /// identity, and two ASLR-randomized addresses (one heap, one stack).
    /// Ids must not be enumerable by a remote peer, so plain sequential
    /// allocation is out. Retries while the masked result is reserved.
    pub fn generate() -> Self {
        let mut hash: u32 = 0;

        while hash == 0 || hash == 1 {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            let heap_probe = Box::new(0u8);

            hash = djb2_one(now.subsec_nanos(), DJB2_SEED);
            hash = djb2_one(now.as_secs() as u32, hash);
            hash = djb2_one(install_hash(), hash);
            hash = djb2_one(&*heap_probe as *const u8 as usize as u32, hash);
            hash = djb2_one(&hash as *const u32 as usize as u32, hash);

            // Clear the sign bit; negative ids mean "no connection" to hosts.
            hash &= 0x7FFF_FFFF;
        }

        Self(hash)
    }

    /// The raw 31-bit value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[cfg(test)]
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const DJB2_SEED: u32 = 5381;

/// Fold one 32-bit value into a running djb2 hash.
fn djb2_one(value: u32, hash: u32) -> u32 {
    hash.wrapping_mul(33).wrapping_add(value)
}

/// Hash of the per-process, per-installation identity: the platform data
/// directory path and the process id.
fn install_hash() -> u32 {
    let dir = dirs::data_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
    let mut hash = DJB2_SEED;
    for byte in dir.to_string_lossy().as_bytes() {
        hash = djb2_one(u32::from(*byte), hash);
    }
    djb2_one(std::process::id(), hash)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_avoid_reserved_values() {
        for _ in 0..1000 {
            let id = ConnectionId::generate();
            assert!(id.as_u32() > 1, "reserved value issued: {id}");
            assert_eq!(id.as_u32() & 0x8000_0000, 0, "sign bit set: {id}");
        }
    }

    #[test]
    fn test_mass_generation_is_collision_resistant() {
        // 10_000 draws from a 31-bit space put the expected birthday
        // collision count well below one; tolerate a single stray pair.
        const N: usize = 10_000;
        let mut seen = HashSet::with_capacity(N);
        for _ in 0..N {
            seen.insert(ConnectionId::generate());
        }
        assert!(seen.len() >= N - 1, "too many collisions: {}", N - seen.len());
    }

    #[test]
    fn test_sequential_ids_differ() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_matches_raw_value() {
        let id = ConnectionId::from_raw(42);
        assert_eq!(format!("{id}"), "42");
        assert_eq!(id.as_u32(), 42);
    }

    #[test]
    fn test_serde_roundtrip() {
        let id = ConnectionId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: ConnectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
