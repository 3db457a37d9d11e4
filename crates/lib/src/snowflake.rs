//! Snowflake ids: 64-bit, timestamp-encoded unique identifiers.
//!
//! Layout (high to low): 42 bits of milliseconds since [`EPOCH_MS`], 5 bits
//! worker id, 5 bits process id, 12 bits per-process increment.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 2015-01-01T00:00:00Z in Unix milliseconds.
pub const EPOCH_MS: u64 = 1_420_070_400_000;

const INCREMENT_BITS: u32 = 12;
const PROCESS_BITS: u32 = 5;
const WORKER_BITS: u32 = 5;

/// A snowflake id. Serialized as a decimal string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Snowflake(pub u64);

/// The fields packed into a snowflake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeconstructedSnowflake {
    pub id: Snowflake,
    pub timestamp: DateTime<Utc>,
    pub worker_id: u8,
    pub process_id: u8,
    pub increment: u16,
}

impl Snowflake {
    /// Unix milliseconds encoded in the id.
    pub fn timestamp_ms(self) -> u64 {
        (self.0 >> (INCREMENT_BITS + PROCESS_BITS + WORKER_BITS)) + EPOCH_MS
    }

    pub fn deconstruct(self) -> DeconstructedSnowflake {
        let mut buf = self.0;
        let increment = (buf & ((1 << INCREMENT_BITS) - 1)) as u16;
        buf >>= INCREMENT_BITS;
        let process_id = (buf & ((1 << PROCESS_BITS) - 1)) as u8;
        buf >>= PROCESS_BITS;
        let worker_id = (buf & ((1 << WORKER_BITS) - 1)) as u8;
        let ms = i64::try_from(self.timestamp_ms()).unwrap_or(i64::MAX);
        let timestamp = Utc
            .timestamp_millis_opt(ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        DeconstructedSnowflake {
            id: self,
            timestamp,
            worker_id,
            process_id,
            increment,
        }
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Snowflake {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Snowflake)
    }
}

impl Serialize for Snowflake {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }
        match Raw::deserialize(d)? {
            Raw::Num(n) => Ok(Snowflake(n)),
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Produces snowflakes for one worker/process pair.
///
/// The increment counter belongs to the generator; two generators never share it.
#[derive(Debug, Clone)]
pub struct SnowflakeGenerator {
    worker_id: u8,
    process_id: u8,
    increment: u16,
}

impl SnowflakeGenerator {
    pub fn new(worker_id: u8, process_id: u8) -> Self {
        Self {
            worker_id: worker_id & ((1 << WORKER_BITS) - 1) as u8,
            process_id: process_id & ((1 << PROCESS_BITS) - 1) as u8,
            increment: 0,
        }
    }

    /// Next id for the given instant. The increment wraps after 4096 ids.
    pub fn generate_at(&mut self, at: DateTime<Utc>) -> Snowflake {
        let ms = u64::try_from(at.timestamp_millis()).unwrap_or(0);
        let since_epoch = ms.saturating_sub(EPOCH_MS);
        let inc = u64::from(self.increment);
        self.increment = (self.increment + 1) & ((1 << INCREMENT_BITS) - 1);
        Snowflake(
            (since_epoch << (INCREMENT_BITS + PROCESS_BITS + WORKER_BITS))
                | (u64::from(self.worker_id) << (INCREMENT_BITS + PROCESS_BITS))
                | (u64::from(self.process_id) << INCREMENT_BITS)
                | inc,
        )
    }

    pub fn generate(&mut self) -> Snowflake {
        self.generate_at(Utc::now())
    }
}
