pub mod file;
pub mod job;
pub mod upload;
pub mod verdict;
pub mod workbook;

pub use file::{
    EncryptionMetadata, FilePermission, ProcessingStatus, QuarantineRecord, SecureFileRecord,
};
pub use job::{JobEvent, JobState, JobSummary, ProcessingJob};
pub use upload::{ChunkOutcome, ChunkSubmission, UploadSession};
pub use verdict::{CheckName, CheckResult, Severity, ValidationIssue, ValidationVerdict};
