pub mod access;
pub mod audit;
pub mod chunk_assembly;
pub mod content_scan;
pub mod encryption;
pub mod export;
pub mod file_manager;
pub mod ingest;
pub mod job_queue;
pub mod key_management;
pub mod kv_store;
pub mod metadata_store;
pub mod ooxml;
pub mod parse_job;
pub mod quarantine;
pub mod retrieval;
pub mod scanner;
pub mod storage;
pub mod validation;
pub mod workbook_cache;
pub mod workbook_parser;
pub mod worker;
