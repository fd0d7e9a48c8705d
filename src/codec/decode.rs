//! Key decoders. Every decoder checks the subspace prefix and field lengths
//! and refuses keys that do not match the expected schema, so that a
//! misdirected scan surfaces as a structural error instead of garbage ids.

use super::encode::{decode_i32_ord, decode_i64_ord, VERSIONSTAMP_LEN};
use super::{subspace, ActiveScope, CodecError, CounterKind};

/// Decoded queue entry key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKey {
    pub team_id: String,
    pub priority: i32,
    pub created_at: i64,
    pub job_id: String,
}

/// Decoded TTL index key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlKey {
    pub expires_at: i64,
    pub team_id: String,
    pub job_id: String,
}

/// Decoded active-job key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveKey {
    pub id: String,
    pub job_id: String,
}

/// Decoded post-commit claim key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimKey {
    pub job_id: String,
    pub versionstamp: [u8; VERSIONSTAMP_LEN],
    pub worker_id: String,
}

/// Decoded semaphore lease key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreKey {
    pub team_id: String,
    pub holder_id: String,
}

struct KeyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> KeyReader<'a> {
    fn new(buf: &'a [u8], prefix: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < prefix.len() {
            return Err(CodecError::TooShort(buf.len()));
        }
        if &buf[..prefix.len()] != prefix {
            return Err(CodecError::WrongSubspace {
                expected: prefix[0],
                found: buf[0],
            });
        }
        Ok(Self {
            buf,
            pos: prefix.len(),
        })
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::LengthOverrun {
                len: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_str(&mut self) -> Result<String, CodecError> {
        let len_bytes: [u8; 4] = self.take(4)?.try_into().unwrap_or_default();
        let len = u32::from_be_bytes(len_bytes) as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    fn read_i32(&mut self) -> Result<i32, CodecError> {
        let raw: [u8; 4] = self.take(4)?.try_into().unwrap_or_default();
        Ok(decode_i32_ord(raw))
    }

    fn read_i64(&mut self) -> Result<i64, CodecError> {
        let raw: [u8; 8] = self.take(8)?.try_into().unwrap_or_default();
        Ok(decode_i64_ord(raw))
    }

    fn finish(self) -> Result<(), CodecError> {
        if self.remaining() > 0 {
            return Err(CodecError::TrailingBytes(self.remaining()));
        }
        Ok(())
    }
}

pub fn decode_queue_key(key: &[u8]) -> Result<QueueKey, CodecError> {
    let mut r = KeyReader::new(key, &[subspace::QUEUE])?;
    let team_id = r.read_str()?;
    let priority = r.read_i32()?;
    let created_at = r.read_i64()?;
    let job_id = r.read_str()?;
    r.finish()?;
    Ok(QueueKey {
        team_id,
        priority,
        created_at,
        job_id,
    })
}

pub fn decode_crawl_index_key(key: &[u8]) -> Result<(String, String), CodecError> {
    let mut r = KeyReader::new(key, &[subspace::CRAWL_INDEX])?;
    let crawl_id = r.read_str()?;
    let job_id = r.read_str()?;
    r.finish()?;
    Ok((crawl_id, job_id))
}

pub fn decode_ttl_index_key(key: &[u8]) -> Result<TtlKey, CodecError> {
    let mut r = KeyReader::new(key, &[subspace::TTL_INDEX])?;
    let expires_at = r.read_i64()?;
    let team_id = r.read_str()?;
    let job_id = r.read_str()?;
    r.finish()?;
    Ok(TtlKey {
        expires_at,
        team_id,
        job_id,
    })
}

pub fn decode_counter_key(key: &[u8]) -> Result<(CounterKind, String), CodecError> {
    if key.len() < 2 {
        return Err(CodecError::TooShort(key.len()));
    }
    if key[0] != subspace::COUNTERS {
        return Err(CodecError::WrongSubspace {
            expected: subspace::COUNTERS,
            found: key[0],
        });
    }
    let kind = CounterKind::from_tag(key[1])?;
    let mut r = KeyReader::new(key, &key[..2])?;
    let id = r.read_str()?;
    r.finish()?;
    Ok((kind, id))
}

pub fn decode_active_key(scope: ActiveScope, key: &[u8]) -> Result<ActiveKey, CodecError> {
    let mut r = KeyReader::new(key, &[scope.prefix_byte()])?;
    let id = r.read_str()?;
    let job_id = r.read_str()?;
    r.finish()?;
    Ok(ActiveKey { id, job_id })
}

pub fn decode_claim_key(key: &[u8]) -> Result<ClaimKey, CodecError> {
    let mut r = KeyReader::new(key, &[subspace::CLAIMS])?;
    let job_id = r.read_str()?;
    let versionstamp: [u8; VERSIONSTAMP_LEN] =
        r.take(VERSIONSTAMP_LEN)?.try_into().unwrap_or_default();
    let worker_id = r.read_str()?;
    r.finish()?;
    Ok(ClaimKey {
        job_id,
        versionstamp,
        worker_id,
    })
}

pub fn decode_semaphore_key(key: &[u8]) -> Result<SemaphoreKey, CodecError> {
    let mut r = KeyReader::new(key, &[subspace::SEMAPHORE])?;
    let team_id = r.read_str()?;
    let holder_id = r.read_str()?;
    r.finish()?;
    Ok(SemaphoreKey {
        team_id,
        holder_id,
    })
}
