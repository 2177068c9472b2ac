//! Append-only, hash-chained record log
//!
//! Every record carries the hash of its predecessor, so any edit or
//! deletion in the middle of the log is detected by [`RecordLog::verify_integrity`].

use crate::error::LogError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hash of the (virtual) record before the first one
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One entry of the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record<T> {
    /// Position in the log, starting at zero
    pub seq: u64,
    /// Append time
    pub recorded_at: DateTime<Utc>,
    /// Caller data
    pub payload: T,
    /// Hex SHA-256 of the previous record
    pub prev_hash: String,
    /// Hex SHA-256 of this record
    pub hash: String,
}

/// Thread-safe append-only log
#[derive(Debug)]
pub struct RecordLog<T> {
    inner: Mutex<Vec<Record<T>>>,
}

impl<T> Default for RecordLog<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }
}

impl<T> RecordLog<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from previously persisted records, verifying the chain.
    ///
    /// # Errors
    /// Returns [`LogError::IntegrityViolation`] if any record was altered.
    pub fn from_records(records: Vec<Record<T>>) -> Result<Self, LogError> {
        verify_chain(&records)?;
        Ok(Self {
            inner: Mutex::new(records),
        })
    }

    /// Append a payload and return the stored record
    ///
    /// # Errors
    /// Fails only if the payload cannot be serialized for hashing.
    pub fn append(&self, payload: T) -> Result<Record<T>, LogError> {
        let mut guard = self.inner.lock();
        let prev_hash = guard
            .last()
            .map_or_else(|| GENESIS_HASH.to_string(), |r| r.hash.clone());
        let mut record = Record {
            seq: guard.len() as u64,
            recorded_at: Utc::now(),
            payload,
            prev_hash,
            hash: String::new(),
        };
        record.hash = compute_hash(&record)?;
        guard.push(record.clone());
        Ok(record)
    }

    /// Snapshot of all records in append order
    #[must_use]
    pub fn records(&self) -> Vec<Record<T>> {
        self.inner.lock().clone()
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when nothing has been appended
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Re-hash the whole chain
    ///
    /// # Errors
    /// Returns [`LogError::IntegrityViolation`] naming the first bad record.
    pub fn verify_integrity(&self) -> Result<(), LogError> {
        verify_chain(&self.inner.lock())
    }
}

fn verify_chain<T: Serialize>(records: &[Record<T>]) -> Result<(), LogError> {
    let mut prev = GENESIS_HASH.to_string();
    for (index, record) in records.iter().enumerate() {
        if record.seq != index as u64 || record.prev_hash != prev {
            return Err(LogError::IntegrityViolation { index });
        }
        if record.hash != compute_hash(record)? {
            return Err(LogError::IntegrityViolation { index });
        }
        prev.clone_from(&record.hash);
    }
    Ok(())
}

fn compute_hash<T: Serialize>(record: &Record<T>) -> Result<String, LogError> {
    let mut hasher = Sha256::new();
    hasher.update(record.seq.to_le_bytes());
    hasher.update(record.recorded_at.timestamp_micros().to_le_bytes());
    hasher.update(serde_json::to_vec(&record.payload)?);
    hasher.update([0]);
    hasher.update(record.prev_hash.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_links_records() {
        let log = RecordLog::new();
        let a = log.append("first".to_string()).unwrap();
        let b = log.append("second".to_string()).unwrap();
        assert_eq!(a.prev_hash, GENESIS_HASH);
        assert_eq!(b.prev_hash, a.hash);
        assert_eq!(log.len(), 2);
        log.verify_integrity().unwrap();
    }

    #[test]
    fn tampering_is_detected() {
        let log = RecordLog::new();
        log.append("one".to_string()).unwrap();
        log.append("two".to_string()).unwrap();
        log.append("three".to_string()).unwrap();

        let mut records = log.records();
        records[1].payload = "TWO".to_string();
        let err = RecordLog::from_records(records).unwrap_err();
        assert!(matches!(err, LogError::IntegrityViolation { index: 1 }));
    }

    #[test]
    fn deletion_is_detected() {
        let log = RecordLog::new();
        for n in 0..3 {
            log.append(n).unwrap();
        }
        let mut records = log.records();
        records.remove(0);
        assert!(RecordLog::from_records(records).is_err());
    }

    #[test]
    fn persisted_records_round_trip_through_json() {
        let log = RecordLog::new();
        log.append(vec!["a".to_string()]).unwrap();
        let json = serde_json::to_string(&log.records()).unwrap();
        let restored: Vec<Record<Vec<String>>> = serde_json::from_str(&json).unwrap();
        let log = RecordLog::from_records(restored).unwrap();
        assert_eq!(log.len(), 1);
    }
}
