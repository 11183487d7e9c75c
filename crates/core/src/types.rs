/// Job identifiers are caller-supplied or generated UUID strings.
pub type JobId = String;

/// Batch identifiers follow the same convention as job identifiers.
pub type BatchId = String;

/// Per-job audit sequence number (starts at 1, strictly increasing).
pub type SequenceNo = u64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
