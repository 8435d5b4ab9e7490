//! Core data models for the file-sharing service.
//!
//! A single entity is persisted: the metadata record describing one uploaded
//! file. It maps to the `files` table via `sqlx::FromRow` and serializes as
//! JSON via `serde`.

pub mod file_record;
