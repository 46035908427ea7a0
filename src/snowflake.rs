//! Time-ordered, globally unique request identifiers.
//!
//! Layout (most significant first): 41 bits of milliseconds since
//! [`EPOCH_MS`], 10 bits of machine id, 12 bits of per-millisecond sequence.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// 2025-01-01T00:00:00Z
pub const EPOCH_MS: u64 = 1_735_689_600_000;

const MACHINE_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const MAX_MACHINE_ID: u16 = (1 << MACHINE_BITS) - 1;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snowflake(u64);

impl Snowflake {
    pub fn from_parts(timestamp_ms: u64, machine_id: u16, sequence: u16) -> Self {
        let since_epoch = timestamp_ms.saturating_sub(EPOCH_MS);
        Snowflake(
            (since_epoch << (MACHINE_BITS + SEQUENCE_BITS))
                | (u64::from(machine_id & MAX_MACHINE_ID) << SEQUENCE_BITS)
                | u64::from(sequence & MAX_SEQUENCE),
        )
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Unix milliseconds the id was minted at.
    pub fn timestamp_ms(self) -> u64 {
        (self.0 >> (MACHINE_BITS + SEQUENCE_BITS)) + EPOCH_MS
    }

    pub fn machine_id(self) -> u16 {
        ((self.0 >> SEQUENCE_BITS) & u64::from(MAX_MACHINE_ID)) as u16
    }

    pub fn sequence(self) -> u16 {
        (self.0 & u64::from(MAX_SEQUENCE)) as u16
    }
}

impl From<u64> for Snowflake {
    fn from(raw: u64) -> Self {
        Snowflake(raw)
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one durable request/reply pair.
pub type RequestId = Snowflake;

/// Mints strictly increasing ids for one machine.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    machine_id: u16,
    // (last timestamp used, last sequence used)
    state: Mutex<(u64, u16)>,
}

impl SnowflakeGenerator {
    pub fn new(machine_id: u16) -> Self {
        Self {
            machine_id: machine_id & MAX_MACHINE_ID,
            state: Mutex::new((0, 0)),
        }
    }

    pub fn next_id(&self) -> Snowflake {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (last_ms, last_seq) = *state;
        // Clock going backwards keeps the previous timestamp.
        let now = now_ms().max(last_ms);
        let (ts, seq) = if now == last_ms {
            if last_seq == MAX_SEQUENCE {
                (last_ms + 1, 0)
            } else {
                (last_ms, last_seq + 1)
            }
        } else {
            (now, 0)
        };
        *state = (ts, seq);
        Snowflake::from_parts(ts, self.machine_id, seq)
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
        .unwrap_or(EPOCH_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_round_trip() {
        let id = Snowflake::from_parts(EPOCH_MS + 12_345, 7, 42);
        assert_eq!(id.timestamp_ms(), EPOCH_MS + 12_345);
        assert_eq!(id.machine_id(), 7);
        assert_eq!(id.sequence(), 42);
    }

    #[test]
    fn ids_strictly_increase_within_one_millisecond_burst() {
        let generator = SnowflakeGenerator::new(3);
        let ids: Vec<Snowflake> = (0..10_000).map(|_| generator.next_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(ids.iter().all(|id| id.machine_id() == 3));
    }
}
