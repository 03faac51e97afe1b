//! Document block registry.
//!
//! Extraction happens elsewhere; the server only needs the ordered block
//! texts of each document to build synthesis jobs.

use dashmap::DashMap;
use lectern_core::{new_entity_id, BlockIndex, DocumentId, ValidationError};
use std::sync::Arc;

/// In-memory store of registered documents.
#[derive(Clone, Default)]
pub struct DocumentStore {
    documents: Arc<DashMap<DocumentId, Arc<Vec<String>>>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a document's blocks under a fresh id.
    pub fn register(&self, blocks: Vec<String>) -> Result<DocumentId, ValidationError> {
        if blocks.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "blocks".to_string(),
            });
        }
        if let Some(idx) = blocks.iter().position(|b| b.trim().is_empty()) {
            return Err(ValidationError::InvalidValue {
                field: format!("blocks[{}]", idx),
                reason: "block text is empty".to_string(),
            });
        }
        let document_id = new_entity_id();
        self.documents.insert(document_id, Arc::new(blocks));
        Ok(document_id)
    }

    pub fn contains(&self, document_id: DocumentId) -> bool {
        self.documents.contains_key(&document_id)
    }

    pub fn block_count(&self, document_id: DocumentId) -> Option<usize> {
        self.documents.get(&document_id).map(|d| d.len())
    }

    /// Text of one block. `None` when the document is unknown.
    pub fn block_text(
        &self,
        document_id: DocumentId,
        block_idx: BlockIndex,
    ) -> Option<Result<String, ValidationError>> {
        let blocks = self.documents.get(&document_id)?.value().clone();
        Some(
            blocks
                .get(block_idx as usize)
                .cloned()
                .ok_or(ValidationError::UnknownBlock {
                    document_id,
                    block_idx,
                }),
        )
    }
}
