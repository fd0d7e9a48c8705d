//! Key and value codec for the queue's FoundationDB subspaces.
//!
//! Keys are length-prefixed tuple encodings: a single-byte subspace prefix,
//! then for each field either a 4-byte big-endian length followed by the raw
//! bytes (strings) or a fixed-width order-preserving big-endian integer.
//! Signed integers are encoded with the sign bit flipped so that the byte
//! order of encoded keys matches the numeric order of the fields, which is
//! what makes `(team, priority, created_at, job_id)` range scans come back
//! in pop order.
//!
//! Counter *values* are little-endian i64 because FoundationDB's atomic ADD
//! mutation operates on that representation. Every other integer in a key is
//! big-endian.

mod decode;
mod encode;

pub use decode::{
    decode_active_key, decode_claim_key, decode_counter_key, decode_crawl_index_key,
    decode_queue_key, decode_semaphore_key, decode_ttl_index_key, ActiveKey, ClaimKey, QueueKey,
    SemaphoreKey, TtlKey,
};
pub use encode::{
    active_key, active_prefix, claim_key, claims_prefix, claims_subspace_range, counter_key,
    counter_prefix, crawl_index_key, crawl_index_prefix, decode_i64_be, decode_i64_le,
    encode_i64_be, encode_i64_le, health_key, next_key, queue_key, queue_prefix, range_end,
    semaphore_key, semaphore_prefix, ttl_index_key, ttl_index_range_until,
};
pub(crate) use encode::active_subspace;

use serde::{Deserialize, Serialize};

/// Subspace prefixes. One byte each; the rest of the key is the tuple
/// encoding for that entity kind.
pub(crate) mod subspace {
    pub const QUEUE: u8 = 0x01;
    pub const CRAWL_INDEX: u8 = 0x02;
    pub const COUNTERS: u8 = 0x03;
    pub const ACTIVE_TEAM: u8 = 0x04;
    pub const ACTIVE_CRAWL: u8 = 0x05;
    pub const TTL_INDEX: u8 = 0x06;
    pub const CLAIMS: u8 = 0x07;
    pub const SEMAPHORE: u8 = 0x08;
}

/// Error type for codec operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("key too short: {0} bytes")]
    TooShort(usize),
    #[error("wrong subspace prefix: expected {expected:#04x}, found {found:#04x}")]
    WrongSubspace { expected: u8, found: u8 },
    #[error("field length {len} overruns key ({remaining} bytes remaining)")]
    LengthOverrun { len: usize, remaining: usize },
    #[error("{0} trailing bytes after final field")]
    TrailingBytes(usize),
    #[error("string field is not valid utf-8")]
    InvalidUtf8,
    #[error("unknown counter kind tag {0:#04x}")]
    UnknownCounterKind(u8),
}

/// Which counter a key addresses. The tag byte follows the counter subspace
/// prefix so that all counters of one kind form a contiguous range for the
/// janitor's pagination cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    TeamQueue,
    CrawlQueue,
    TeamActive,
    CrawlActive,
}

impl CounterKind {
    pub const ALL: [CounterKind; 4] = [
        CounterKind::TeamQueue,
        CounterKind::CrawlQueue,
        CounterKind::TeamActive,
        CounterKind::CrawlActive,
    ];

    pub(crate) fn tag(self) -> u8 {
        match self {
            CounterKind::TeamQueue => 0x01,
            CounterKind::CrawlQueue => 0x02,
            CounterKind::TeamActive => 0x03,
            CounterKind::CrawlActive => 0x04,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0x01 => Ok(CounterKind::TeamQueue),
            0x02 => Ok(CounterKind::CrawlQueue),
            0x03 => Ok(CounterKind::TeamActive),
            0x04 => Ok(CounterKind::CrawlActive),
            other => Err(CodecError::UnknownCounterKind(other)),
        }
    }
}

/// Scope of an active-job record: executing on behalf of a team, or of a
/// crawl within a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveScope {
    Team,
    Crawl,
}

impl ActiveScope {
    pub(crate) fn prefix_byte(self) -> u8 {
        match self {
            ActiveScope::Team => subspace::ACTIVE_TEAM,
            ActiveScope::Crawl => subspace::ACTIVE_CRAWL,
        }
    }

    pub fn counter_kind(self) -> CounterKind {
        match self {
            ActiveScope::Team => CounterKind::TeamActive,
            ActiveScope::Crawl => CounterKind::CrawlActive,
        }
    }
}

/// The authoritative queue entry value. The payload is opaque to the queue;
/// base64 keeps it byte-faithful through the JSON value encoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueJob {
    pub id: String,
    pub team_id: String,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    pub priority: i32,
    pub listenable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawl_id: Option<String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub times_out_at: Option<i64>,
}

/// Crawl-index entry value: enough to rebuild the queue key without a scan
/// over the team subspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrawlIndexEntry {
    pub team_id: String,
    pub priority: i32,
    pub created_at: i64,
}

/// TTL-index entry value: enough to rebuild the queue key of the expired job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TtlIndexEntry {
    pub priority: i32,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawl_id: Option<String>,
}

/// Claim record value. The queue key travels in the claim so the orphan
/// sweep can check entry existence without decoding the claim key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimRecord {
    pub worker_id: String,
    #[serde(with = "b64")]
    pub queue_key: Vec<u8>,
    pub claimed_at: i64,
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
