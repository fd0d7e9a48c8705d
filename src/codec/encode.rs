//! Key builders. Each entity kind gets a `*_key` constructor plus the
//! prefixes used for range scans over it.

use super::{subspace, ActiveScope, CounterKind};

/// Versionstamp placeholder: 10 bytes, overwritten by the store at commit
/// (8-byte commit version + 2-byte batch order).
pub(crate) const VERSIONSTAMP_LEN: usize = 10;
const VERSIONSTAMP_PLACEHOLDER: [u8; VERSIONSTAMP_LEN] = [0xff; VERSIONSTAMP_LEN];

fn push_str(key: &mut Vec<u8>, s: &str) {
    key.extend_from_slice(&(s.len() as u32).to_be_bytes());
    key.extend_from_slice(s.as_bytes());
}

/// Order-preserving encoding for signed 32-bit integers: flipping the sign
/// bit maps the two's-complement range onto an unsigned range with the same
/// ordering, so negative priorities sort before positive ones.
pub(crate) fn encode_i32_ord(n: i32) -> [u8; 4] {
    ((n as u32) ^ (1 << 31)).to_be_bytes()
}

pub(crate) fn decode_i32_ord(buf: [u8; 4]) -> i32 {
    (u32::from_be_bytes(buf) ^ (1 << 31)) as i32
}

/// Order-preserving encoding for signed 64-bit integers.
pub(crate) fn encode_i64_ord(n: i64) -> [u8; 8] {
    ((n as u64) ^ (1 << 63)).to_be_bytes()
}

pub(crate) fn decode_i64_ord(buf: [u8; 8]) -> i64 {
    (u64::from_be_bytes(buf) ^ (1 << 63)) as i64
}

/// Little-endian i64, the representation FoundationDB's atomic ADD mutates.
pub fn encode_i64_le(n: i64) -> [u8; 8] {
    n.to_le_bytes()
}

pub fn decode_i64_le(buf: &[u8]) -> i64 {
    if buf.len() < 8 {
        return 0;
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&buf[..8]);
    i64::from_le_bytes(arr)
}

/// Big-endian i64 for plain (non-key, non-counter) values such as active
/// record and semaphore lease expiries.
pub fn encode_i64_be(n: i64) -> [u8; 8] {
    n.to_be_bytes()
}

pub fn decode_i64_be(buf: &[u8]) -> i64 {
    if buf.len() < 8 {
        return 0;
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&buf[..8]);
    i64::from_be_bytes(arr)
}

/// Exclusive upper bound for a range scan over everything under `prefix`.
///
/// Every field following a subspace prefix starts with either a 4-byte
/// big-endian length (first byte 0x00 for any realistic length) or an
/// order-encoded integer, so a single 0xff byte is strictly greater than
/// any continuation.
pub fn range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    end.push(0xff);
    end
}

/// Smallest key strictly greater than `key`; used for pagination cursors.
pub fn next_key(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0x00);
    next
}

// --- queue subspace ---

/// `(team_id, priority, created_at, job_id)` — the authoritative entry.
pub fn queue_key(team_id: &str, priority: i32, created_at: i64, job_id: &str) -> Vec<u8> {
    let mut key = vec![subspace::QUEUE];
    push_str(&mut key, team_id);
    key.extend_from_slice(&encode_i32_ord(priority));
    key.extend_from_slice(&encode_i64_ord(created_at));
    push_str(&mut key, job_id);
    key
}

pub fn queue_prefix(team_id: &str) -> Vec<u8> {
    let mut key = vec![subspace::QUEUE];
    push_str(&mut key, team_id);
    key
}

// --- crawl index ---

pub fn crawl_index_key(crawl_id: &str, job_id: &str) -> Vec<u8> {
    let mut key = vec![subspace::CRAWL_INDEX];
    push_str(&mut key, crawl_id);
    push_str(&mut key, job_id);
    key
}

pub fn crawl_index_prefix(crawl_id: &str) -> Vec<u8> {
    let mut key = vec![subspace::CRAWL_INDEX];
    push_str(&mut key, crawl_id);
    key
}

// --- counters ---

pub fn counter_key(kind: CounterKind, id: &str) -> Vec<u8> {
    let mut key = vec![subspace::COUNTERS, kind.tag()];
    push_str(&mut key, id);
    key
}

pub fn counter_prefix(kind: CounterKind) -> Vec<u8> {
    vec![subspace::COUNTERS, kind.tag()]
}

// --- active jobs ---

pub fn active_key(scope: ActiveScope, id: &str, job_id: &str) -> Vec<u8> {
    let mut key = vec![scope.prefix_byte()];
    push_str(&mut key, id);
    push_str(&mut key, job_id);
    key
}

pub fn active_prefix(scope: ActiveScope, id: &str) -> Vec<u8> {
    let mut key = vec![scope.prefix_byte()];
    push_str(&mut key, id);
    key
}

/// Prefix covering the whole active subspace for a scope, for janitor sweeps.
pub(crate) fn active_subspace(scope: ActiveScope) -> Vec<u8> {
    vec![scope.prefix_byte()]
}

// --- TTL index ---

/// `(expires_at, team_id, job_id)`, ordered by expiry for cheap sweeps.
pub fn ttl_index_key(expires_at: i64, team_id: &str, job_id: &str) -> Vec<u8> {
    let mut key = vec![subspace::TTL_INDEX];
    key.extend_from_slice(&encode_i64_ord(expires_at));
    push_str(&mut key, team_id);
    push_str(&mut key, job_id);
    key
}

/// Range covering every TTL entry with `expires_at < until`.
pub fn ttl_index_range_until(until: i64) -> (Vec<u8>, Vec<u8>) {
    let start = vec![subspace::TTL_INDEX];
    let mut end = vec![subspace::TTL_INDEX];
    end.extend_from_slice(&encode_i64_ord(until));
    (start, end)
}

// --- claims ---

/// Build a claim key ready for a `SetVersionstampedKey` mutation.
///
/// Pre-commit layout sent to the store:
///   CLAIMS + job_id_len(4) + job_id + placeholder(10) + worker_id_len(4) + worker_id + offset(4 LE)
///
/// The store replaces the placeholder with the commit versionstamp and
/// strips the trailing offset, leaving:
///   CLAIMS + job_id_len(4) + job_id + versionstamp(10) + worker_id_len(4) + worker_id
///
/// The versionstamp sits before the worker id, so a forward scan over a
/// job's claim range yields the winner (minimal versionstamp) first. The
/// worker id sits after the placeholder, so two workers' pre-commit keys
/// never collide and the writes cannot conflict.
pub fn claim_key(job_id: &str, worker_id: &str) -> Vec<u8> {
    let mut key = vec![subspace::CLAIMS];
    push_str(&mut key, job_id);
    let versionstamp_offset = key.len() as u32;
    key.extend_from_slice(&VERSIONSTAMP_PLACEHOLDER);
    push_str(&mut key, worker_id);
    key.extend_from_slice(&versionstamp_offset.to_le_bytes());
    key
}

/// Prefix over all claims for one job.
pub fn claims_prefix(job_id: &str) -> Vec<u8> {
    let mut key = vec![subspace::CLAIMS];
    push_str(&mut key, job_id);
    key
}

/// The entire claims subspace, for the orphan sweep.
pub fn claims_subspace_range() -> (Vec<u8>, Vec<u8>) {
    let start = vec![subspace::CLAIMS];
    let end = range_end(&start);
    (start, end)
}

// --- semaphore ---

pub fn semaphore_key(team_id: &str, holder_id: &str) -> Vec<u8> {
    let mut key = vec![subspace::SEMAPHORE];
    push_str(&mut key, team_id);
    push_str(&mut key, holder_id);
    key
}

pub fn semaphore_prefix(team_id: &str) -> Vec<u8> {
    let mut key = vec![subspace::SEMAPHORE];
    push_str(&mut key, team_id);
    key
}

// --- misc ---

/// Sentinel key probed by the health check. Never written.
pub fn health_key() -> Vec<u8> {
    b"\xfe__health__".to_vec()
}
