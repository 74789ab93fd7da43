pub mod prelude;

pub mod file_permissions;
pub mod processing_jobs;
pub mod quarantined_files;
pub mod secure_files;
