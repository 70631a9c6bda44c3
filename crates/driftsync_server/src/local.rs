//! In-process transport adapter.
//!
//! [`LocalClient`] implements the core crate's [`ReplicateClient`]
//! contract directly over a shared [`ReplicateStore`]. Tests and
//! embedded (single-process) deployments use it in place of a network
//! transport; server errors surface through the same `{status, message}`
//! envelope remote clients see.

use std::sync::Arc;

use async_trait::async_trait;
use driftsync_core::{
    DeleteDocumentRequest, InsertDocumentRequest, MutationResponse, ReplicateClient, SsrRequest,
    SsrResponse, StreamRequest, StreamResponse, TransportError, UpdateDocumentRequest,
};

use crate::error::ServerError;
use crate::store::ReplicateStore;

/// [`ReplicateClient`] over an in-process [`ReplicateStore`].
#[derive(Clone)]
pub struct LocalClient {
    store: Arc<ReplicateStore>,
}

impl LocalClient {
    pub fn new(store: Arc<ReplicateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ReplicateStore> {
        &self.store
    }
}

fn to_transport_error(error: ServerError) -> TransportError {
    TransportError::new(error.status(), error.to_string())
}

#[async_trait]
impl ReplicateClient for LocalClient {
    async fn insert_document(
        &self,
        request: InsertDocumentRequest,
    ) -> Result<MutationResponse, TransportError> {
        self.store
            .insert_document(request)
            .map_err(to_transport_error)
    }

    async fn update_document(
        &self,
        request: UpdateDocumentRequest,
    ) -> Result<MutationResponse, TransportError> {
        self.store
            .update_document(request)
            .map_err(to_transport_error)
    }

    async fn delete_document(
        &self,
        request: DeleteDocumentRequest,
    ) -> Result<MutationResponse, TransportError> {
        self.store
            .delete_document(request)
            .map_err(to_transport_error)
    }

    async fn stream(&self, request: StreamRequest) -> Result<StreamResponse, TransportError> {
        self.store.stream(request).map_err(to_transport_error)
    }

    async fn ssr(&self, request: SsrRequest) -> Result<SsrResponse, TransportError> {
        self.store.ssr(request).map_err(to_transport_error)
    }

    async fn protocol_version(&self) -> Result<u32, TransportError> {
        Ok(self.store.protocol_version())
    }
}
