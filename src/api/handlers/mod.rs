pub mod data;
pub mod files;
pub mod health;
pub mod jobs;
pub mod upload;
