//! Upload session lifecycle.
//!
//! ```text
//!   Open ──part──▶ Open
//!   Open ──complete──▶ Completing ──commit ok──▶ Committed
//!                      Completing ──commit failed──▶ Open
//!   Open | Completing ──abort──▶ Aborted
//!   Open ──ttl elapsed──▶ Expired
//! ```
//!
//! `Committed`, `Aborted` and `Expired` are terminal.

use crate::services::{
    digest::{HashAccumulator, PartDigest},
    error::{UploadError, UploadResult},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use uuid::Uuid;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Completing,
    Committed,
    Aborted,
    Expired,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted | Self::Expired)
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Open, Open)
                | (Open, Completing)
                | (Completing, Committed)
                | (Completing, Open)
                | (Open, Aborted)
                | (Completing, Aborted)
                | (Open, Expired)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Completing => "completing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accepted part. Never modified after it is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartRecord {
    pub index: u32,
    pub size: u64,
    /// Backend-assigned tag for the stored part.
    pub etag: String,
    pub digest: PartDigest,
}

/// A part whose bytes are being written to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub digest: PartDigest,
    pub writers: u32,
}

/// Outcome of [`UploadSession::reserve_part`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Identical content is already recorded; nothing to write.
    Existing(PartRecord),
    /// The caller may write the part to this backend upload.
    Reserved { backend_upload_id: String },
}

/// Client-supplied parameters for a new session, after parsing.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub owner: String,
    pub content_type: String,
    pub total_size: u64,
    pub part_size: u64,
    pub filename: Option<String>,
    /// Peer address of the client that opened the session, when known.
    pub uploader_ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: SessionId,
    pub owner: String,
    pub content_type: String,
    pub filename: Option<String>,
    pub uploader_ip: Option<String>,
    pub total_size: u64,
    pub part_size: u64,
    pub expected_part_count: u32,
    pub object_key: String,
    /// Handle of the multipart upload on the storage backend.
    pub backend_upload_id: String,
    pub received_parts: BTreeMap<u32, PartRecord>,
    /// Parts whose bytes are on their way to the backend.
    pub in_flight: BTreeMap<u32, InFlight>,
    pub digest: HashAccumulator,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(
        id: SessionId,
        spec: SessionSpec,
        expected_part_count: u32,
        object_key: String,
        backend_upload_id: String,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id,
            owner: spec.owner,
            content_type: spec.content_type,
            filename: spec.filename,
            uploader_ip: spec.uploader_ip,
            total_size: spec.total_size,
            part_size: spec.part_size,
            expected_part_count,
            object_key,
            backend_upload_id,
            received_parts: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            digest: HashAccumulator::new(),
            status: SessionStatus::Open,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// Exact byte length part `index` must have.
    pub fn expected_part_size(&self, index: u32) -> u64 {
        let last = self.expected_part_count.saturating_sub(1);
        if index < last {
            self.part_size
        } else {
            self.total_size - self.part_size * u64::from(last)
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn missing_parts(&self) -> Vec<u32> {
        (0..self.expected_part_count)
            .filter(|i| !self.received_parts.contains_key(i))
            .collect()
    }

    pub fn received_indices(&self) -> Vec<u32> {
        self.received_parts.keys().copied().collect()
    }

    pub fn ordered_etags(&self) -> Vec<(u32, String)> {
        self.received_parts
            .values()
            .map(|p| (p.index, p.etag.clone()))
            .collect()
    }

    pub fn ensure_open(&self) -> UploadResult<()> {
        if self.status == SessionStatus::Open {
            Ok(())
        } else {
            Err(UploadError::SessionNotOpen {
                id: self.id,
                status: self.status,
            })
        }
    }

    pub fn transition(&mut self, next: SessionStatus) -> UploadResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(UploadError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Claim `index` for a backend write of content with `digest`.
    ///
    /// Concurrent writers of identical content share the claim; different
    /// content for a recorded or claimed index is a `DigestConflict`.
    pub fn reserve_part(&mut self, index: u32, digest: PartDigest) -> UploadResult<Reservation> {
        self.ensure_open()?;
        if index >= self.expected_part_count {
            return Err(UploadError::OutOfRange {
                index,
                expected: self.expected_part_count,
            });
        }
        if let Some(existing) = self.received_parts.get(&index) {
            return if existing.digest == digest {
                Ok(Reservation::Existing(existing.clone()))
            } else {
                Err(UploadError::DigestConflict { index })
            };
        }
        match self.in_flight.get_mut(&index) {
            Some(claim) if claim.digest != digest => {
                return Err(UploadError::DigestConflict { index });
            }
            Some(claim) => claim.writers += 1,
            None => {
                self.in_flight.insert(index, InFlight { digest, writers: 1 });
            }
        }
        Ok(Reservation::Reserved {
            backend_upload_id: self.backend_upload_id.clone(),
        })
    }

    /// Drop one writer's claim on `index`.
    pub fn release_part(&mut self, index: u32) {
        if let Some(claim) = self.in_flight.get_mut(&index) {
            claim.writers = claim.writers.saturating_sub(1);
            if claim.writers == 0 {
                self.in_flight.remove(&index);
            }
        }
    }

    /// Store an accepted part.
    ///
    /// Re-recording identical content returns the existing record untouched;
    /// different content for a recorded index is a `DigestConflict`.
    pub fn record_part(&mut self, record: PartRecord) -> UploadResult<PartRecord> {
        self.ensure_open()?;
        if record.index >= self.expected_part_count {
            return Err(UploadError::OutOfRange {
                index: record.index,
                expected: self.expected_part_count,
            });
        }
        if let Some(existing) = self.received_parts.get(&record.index) {
            return if existing.digest == record.digest {
                Ok(existing.clone())
            } else {
                Err(UploadError::DigestConflict {
                    index: record.index,
                })
            };
        }
        self.digest.feed_digest(record.index, record.digest)?;
        self.received_parts.insert(record.index, record.clone());
        Ok(record)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_session(total_size: u64, part_size: u64) -> UploadSession {
        let count = total_size.div_ceil(part_size) as u32;
        UploadSession::new(
            Uuid::new_v4(),
            SessionSpec {
                owner: "tester".into(),
                content_type: "text/plain".into(),
                total_size,
                part_size,
                filename: None,
                uploader_ip: None,
            },
            count,
            "uploads/test".into(),
            "backend-1".into(),
            Utc::now(),
            Duration::hours(1),
        )
    }

    fn record(index: u32, bytes: &[u8]) -> PartRecord {
        PartRecord {
            index,
            size: bytes.len() as u64,
            etag: format!("etag-{}", index),
            digest: PartDigest::compute(bytes),
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use SessionStatus::*;
        let all = [Open, Completing, Committed, Aborted, Expired];
        for from in [Committed, Aborted, Expired] {
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn completing_cannot_expire() {
        assert!(!SessionStatus::Completing.can_transition_to(SessionStatus::Expired));
    }

    #[test]
    fn last_part_carries_the_remainder() {
        let session = sample_session(10, 4);
        assert_eq!(session.expected_part_count, 3);
        assert_eq!(session.expected_part_size(0), 4);
        assert_eq!(session.expected_part_size(1), 4);
        assert_eq!(session.expected_part_size(2), 2);
    }

    #[test]
    fn exact_multiple_has_full_last_part() {
        let session = sample_session(8, 4);
        assert_eq!(session.expected_part_count, 2);
        assert_eq!(session.expected_part_size(1), 4);
    }

    #[test]
    fn record_part_rejects_out_of_range() {
        let mut session = sample_session(8, 4);
        let err = session.record_part(record(2, b"abcd")).unwrap_err();
        assert!(matches!(err, UploadError::OutOfRange { index: 2, expected: 2 }));
        assert!(session.received_parts.is_empty());
    }

    #[test]
    fn duplicate_part_is_idempotent_or_conflicts() {
        let mut session = sample_session(8, 4);
        let first = session.record_part(record(0, b"abcd")).unwrap();

        let mut again = record(0, b"abcd");
        again.etag = "other".into();
        assert_eq!(session.record_part(again).unwrap(), first);

        let err = session.record_part(record(0, b"zzzz")).unwrap_err();
        assert!(matches!(err, UploadError::DigestConflict { index: 0 }));
        assert_eq!(session.received_parts[&0], first);
    }

    #[test]
    fn closed_session_refuses_parts() {
        let mut session = sample_session(8, 4);
        session.transition(SessionStatus::Aborted).unwrap();
        let err = session.record_part(record(0, b"abcd")).unwrap_err();
        assert!(matches!(err, UploadError::SessionNotOpen { .. }));
    }

    #[test]
    fn reservations_block_conflicting_writers() {
        let mut session = sample_session(8, 4);
        let a = PartDigest::compute(b"aaaa");
        let b = PartDigest::compute(b"bbbb");

        assert!(matches!(
            session.reserve_part(0, a).unwrap(),
            Reservation::Reserved { .. }
        ));
        assert!(matches!(
            session.reserve_part(0, a).unwrap(),
            Reservation::Reserved { .. }
        ));
        assert!(matches!(
            session.reserve_part(0, b),
            Err(UploadError::DigestConflict { index: 0 })
        ));

        session.release_part(0);
        assert_eq!(session.in_flight[&0].writers, 1);
        session.release_part(0);
        assert!(session.in_flight.is_empty());

        let recorded = session.record_part(record(0, b"aaaa")).unwrap();
        assert_eq!(
            session.reserve_part(0, a).unwrap(),
            Reservation::Existing(recorded)
        );
        assert!(matches!(
            session.reserve_part(0, b),
            Err(UploadError::DigestConflict { index: 0 })
        ));
    }

    #[test]
    fn missing_parts_tracks_coverage() {
        let mut session = sample_session(12, 4);
        session.record_part(record(1, b"bbbb")).unwrap();
        assert_eq!(session.missing_parts(), vec![0, 2]);
        assert_eq!(session.received_indices(), vec![1]);
    }
}
