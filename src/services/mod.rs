//! Storage core: code generation, blob and metadata stores, the upload and
//! download coordinator, and expiry reconciliation.

pub mod blob_store;
pub mod code_generator;
pub mod file_service;
pub mod memory_blob_store;
pub mod metadata_store;
pub mod reconciler;
pub mod scheduler;
pub mod sftp_blob_store;

#[cfg(test)]
pub(crate) mod testing;
