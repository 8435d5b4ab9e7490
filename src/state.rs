//! Shared state handed to every handler.

use crate::services::{
    blob_store::BlobStore, file_service::FileService, metadata_store::MetadataStore,
    reconciler::Reconciler,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub files: FileService,
    pub reconciler: Reconciler,
    pub metadata: Arc<dyn MetadataStore>,
    pub blobs: Arc<dyn BlobStore>,
}
