//! Persisted record types and their line encoding
//!
//! Both files are line oriented with `|` as the field separator. The
//! snapshot starts with a `U2|<version>|<ts>` header followed by one line per
//! live record; the journal holds delta lines appended since the last
//! compaction.

use std::fmt;

use bitflags::bitflags;
use sha2::{Digest, Sha256};

use super::day::DayKey;
use super::StateError;

pub const SNAPSHOT_MAGIC: &str = "U2";
pub const SNAPSHOT_VERSION: u32 = 1;

bitflags! {
    /// Per-entry flags of a file fingerprint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FingerprintFlags: u8 {
        /// The slot holds a live entry.
        const ACTIVE = 0b001;
        /// Not a candidate for capacity eviction.
        const PERSISTENT = 0b010;
        /// `md5` holds a content hash.
        const HAS_MD5 = 0b100;
    }
}

/// 64-bit hash of a file path, written as 16 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathHash(u64);

impl PathHash {
    /// First eight bytes of the SHA-256 of the path.
    pub fn of_path(path: &str) -> PathHash {
        let digest = Sha256::digest(path.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        PathHash(u64::from_be_bytes(bytes))
    }

    pub fn parse(token: &str) -> Result<PathHash, StateError> {
        if token.len() != 16 {
            return Err(StateError::Malformed(format!("path hash '{}'", token)));
        }
        u64::from_str_radix(token, 16)
            .map(PathHash)
            .map_err(|_| StateError::Malformed(format!("path hash '{}'", token)))
    }
}

impl fmt::Display for PathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Change-detection record for one file on the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFingerprint {
    pub path_hash: PathHash,
    pub size: u64,
    pub md5: Option<[u8; 16]>,
    pub flags: FingerprintFlags,
}

impl FileFingerprint {
    /// Size-only fingerprint for large sequential data files.
    pub fn size_only(path_hash: PathHash, size: u64) -> Self {
        Self {
            path_hash,
            size,
            md5: None,
            flags: FingerprintFlags::ACTIVE | FingerprintFlags::PERSISTENT,
        }
    }

    /// Content-hash fingerprint for small settings files.
    pub fn with_md5(path_hash: PathHash, size: u64, md5: [u8; 16]) -> Self {
        Self {
            path_hash,
            size,
            md5: Some(md5),
            flags: FingerprintFlags::ACTIVE | FingerprintFlags::HAS_MD5,
        }
    }

    fn from_parts(path_hash: PathHash, size: u64, md5: Option<[u8; 16]>) -> Self {
        match md5 {
            Some(md5) => Self::with_md5(path_hash, size, md5),
            None => Self::size_only(path_hash, size),
        }
    }

    pub fn is_active(&self) -> bool {
        self.flags.contains(FingerprintFlags::ACTIVE)
    }

    pub fn is_persistent(&self) -> bool {
        self.flags.contains(FingerprintFlags::PERSISTENT)
    }

    pub fn has_md5(&self) -> bool {
        self.flags.contains(FingerprintFlags::HAS_MD5)
    }

    fn fields(&self) -> String {
        let md5 = self.md5.map(hex::encode).unwrap_or_else(|| "-".to_string());
        format!("{}|{}|{}", self.path_hash, self.size, md5)
    }
}

/// The single folder currently being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryState {
    pub day: DayKey,
    pub count: u32,
}

impl RetryState {
    pub fn is_active(&self) -> bool {
        !self.day.is_none()
    }
}

/// A state delta, appended to the journal in mutation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEvent {
    AddCompleted(DayKey),
    RemoveCompleted(DayKey),
    AddPending { day: DayKey, first_seen: u64 },
    RemovePending(DayKey),
    SetFile(FileFingerprint),
    RemoveFile(PathHash),
    SetRetry(RetryState),
    SetTimestamp(u64),
}

impl JournalEvent {
    pub fn to_line(&self) -> String {
        match self {
            JournalEvent::AddCompleted(day) => format!("C+|{}", day),
            JournalEvent::RemoveCompleted(day) => format!("C-|{}", day),
            JournalEvent::AddPending { day, first_seen } => format!("P+|{}|{}", day, first_seen),
            JournalEvent::RemovePending(day) => format!("P-|{}", day),
            JournalEvent::SetFile(entry) => format!("F|{}", entry.fields()),
            JournalEvent::RemoveFile(hash) => format!("F-|{}", hash),
            JournalEvent::SetRetry(retry) => format!("R|{}|{}", retry.day, retry.count),
            JournalEvent::SetTimestamp(ts) => format!("T|{}", ts),
        }
    }

    pub fn parse_line(line: &str) -> Result<JournalEvent, StateError> {
        let fields: Vec<&str> = line.split('|').collect();
        let event = match fields.as_slice() {
            ["C+", day] => JournalEvent::AddCompleted(folder_day(day)?),
            ["C-", day] => JournalEvent::RemoveCompleted(folder_day(day)?),
            ["P+", day, ts] => JournalEvent::AddPending {
                day: folder_day(day)?,
                first_seen: number(ts)?,
            },
            ["P-", day] => JournalEvent::RemovePending(folder_day(day)?),
            ["F", hash, size, md5] => JournalEvent::SetFile(fingerprint(hash, size, md5)?),
            ["F-", hash] => JournalEvent::RemoveFile(PathHash::parse(hash)?),
            ["R", day, count] => JournalEvent::SetRetry(retry(day, count)?),
            ["T", ts] => JournalEvent::SetTimestamp(number(ts)?),
            _ => return Err(StateError::Malformed(format!("journal line '{}'", line))),
        };
        Ok(event)
    }
}

/// One body line of the snapshot file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotRecord {
    Retry(RetryState),
    Completed(DayKey),
    Pending { day: DayKey, first_seen: u64 },
    File(FileFingerprint),
}

impl SnapshotRecord {
    pub fn to_line(&self) -> String {
        match self {
            SnapshotRecord::Retry(retry) => format!("R|{}|{}", retry.day, retry.count),
            SnapshotRecord::Completed(day) => format!("C|{}", day),
            SnapshotRecord::Pending { day, first_seen } => format!("P|{}|{}", day, first_seen),
            SnapshotRecord::File(entry) => format!("F|{}", entry.fields()),
        }
    }

    pub fn parse_line(line: &str) -> Result<SnapshotRecord, StateError> {
        let fields: Vec<&str> = line.split('|').collect();
        let record = match fields.as_slice() {
            ["R", day, count] => SnapshotRecord::Retry(retry(day, count)?),
            ["C", day] => SnapshotRecord::Completed(folder_day(day)?),
            ["P", day, ts] => SnapshotRecord::Pending {
                day: folder_day(day)?,
                first_seen: number(ts)?,
            },
            ["F", hash, size, md5] => SnapshotRecord::File(fingerprint(hash, size, md5)?),
            _ => return Err(StateError::Malformed(format!("snapshot line '{}'", line))),
        };
        Ok(record)
    }

    /// The journal event that has the same effect when applied.
    pub fn into_event(self) -> JournalEvent {
        match self {
            SnapshotRecord::Retry(retry) => JournalEvent::SetRetry(retry),
            SnapshotRecord::Completed(day) => JournalEvent::AddCompleted(day),
            SnapshotRecord::Pending { day, first_seen } => {
                JournalEvent::AddPending { day, first_seen }
            }
            SnapshotRecord::File(entry) => JournalEvent::SetFile(entry),
        }
    }
}

/// `U2|<version>|<lastUploadTimestampSeconds>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub version: u32,
    pub last_upload_timestamp: u64,
}

impl SnapshotHeader {
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}",
            SNAPSHOT_MAGIC, self.version, self.last_upload_timestamp
        )
    }

    pub fn parse_line(line: &str) -> Result<SnapshotHeader, StateError> {
        let fields: Vec<&str> = line.split('|').collect();
        match fields.as_slice() {
            [magic, version, ts] if *magic == SNAPSHOT_MAGIC => Ok(SnapshotHeader {
                version: number(version)? as u32,
                last_upload_timestamp: number(ts)?,
            }),
            _ => Err(StateError::Malformed(format!("snapshot header '{}'", line))),
        }
    }
}

fn number(token: &str) -> Result<u64, StateError> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(StateError::Malformed(format!("number '{}'", token)));
    }
    token
        .parse::<u64>()
        .map_err(|_| StateError::Malformed(format!("number '{}'", token)))
}

fn folder_day(token: &str) -> Result<DayKey, StateError> {
    DayKey::from_folder(token)
}

fn retry(day: &str, count: &str) -> Result<RetryState, StateError> {
    let day = DayKey::parse(day)?;
    let count = u32::try_from(number(count)?)
        .map_err(|_| StateError::Malformed(format!("retry count '{}'", count)))?;
    Ok(RetryState { day, count })
}

fn fingerprint(hash: &str, size: &str, md5: &str) -> Result<FileFingerprint, StateError> {
    let path_hash = PathHash::parse(hash)?;
    let size = number(size)?;
    let md5 = if md5 == "-" {
        None
    } else {
        let bytes =
            hex::decode(md5).map_err(|e| StateError::Malformed(format!("md5 '{}': {}", md5, e)))?;
        let digest: [u8; 16] = bytes
            .try_into()
            .map_err(|_| StateError::Malformed(format!("md5 '{}' is not 16 bytes", md5)))?;
        Some(digest)
    };
    Ok(FileFingerprint::from_parts(path_hash, size, md5))
}
