pub use super::file_permissions::Entity as FilePermissions;
pub use super::processing_jobs::Entity as ProcessingJobs;
pub use super::quarantined_files::Entity as QuarantinedFiles;
pub use super::secure_files::Entity as SecureFiles;
