use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Retrieval service unavailable: {0}")]
    Unavailable(String),
    #[error("Retrieval query failed: {0}")]
    Query(String),
    #[error("Retrieval timed out after {0} seconds")]
    Timeout(u64),
}

/// One passage returned by similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub content: String,
    pub source_document: String,
    /// Smaller is closer.
    pub distance: f32,
}

#[async_trait]
pub trait RetrievalService: Send + Sync {
    async fn search(&self, query: &str, limit: usize)
    -> Result<Vec<RetrievedChunk>, RetrievalError>;
}

/// Retrieval that never finds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRetrieval;

#[async_trait]
impl RetrievalService for NoRetrieval {
    async fn search(
        &self,
        _query: &str,
        _limit: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        Ok(Vec::new())
    }
}

/// Always returns the same chunks, closest first, capped at `limit`.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default, Clone)]
pub struct StaticRetrieval {
    chunks: Vec<RetrievedChunk>,
}

#[cfg(any(test, feature = "test-utils"))]
impl StaticRetrieval {
    pub fn new(mut chunks: Vec<RetrievedChunk>) -> Self {
        chunks.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        Self { chunks }
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl RetrievalService for StaticRetrieval {
    async fn search(
        &self,
        _query: &str,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        Ok(self.chunks.iter().take(limit).cloned().collect())
    }
}

/// Citation payload stored on an assistant message, `None` when empty.
pub fn citations_from(chunks: &[RetrievedChunk]) -> Option<serde_json::Value> {
    if chunks.is_empty() {
        return None;
    }
    serde_json::to_value(chunks).ok()
}

/// Distinct source documents in first-seen order.
pub fn cited_documents(chunks: &[RetrievedChunk]) -> Vec<String> {
    let mut documents: Vec<String> = Vec::new();
    for chunk in chunks {
        if !documents.contains(&chunk.source_document) {
            documents.push(chunk.source_document.clone());
        }
    }
    documents
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(document: &str, distance: f32) -> RetrievedChunk {
        RetrievedChunk {
            content: format!("from {document}"),
            source_document: document.to_string(),
            distance,
        }
    }

    #[tokio::test]
    async fn static_retrieval_returns_closest_first() {
        let retrieval = StaticRetrieval::new(vec![chunk("far.pdf", 0.9), chunk("near.pdf", 0.1)]);
        let found = retrieval.search("q", 1).await.unwrap();
        assert_eq!(found, vec![chunk("near.pdf", 0.1)]);
    }

    #[test]
    fn citations_and_documents() {
        assert_eq!(citations_from(&[]), None);

        let chunks = vec![chunk("a.pdf", 0.1), chunk("b.pdf", 0.2), chunk("a.pdf", 0.3)];
        let citations = citations_from(&chunks).unwrap();
        assert_eq!(citations.as_array().map(Vec::len), Some(3));
        assert_eq!(cited_documents(&chunks), vec!["a.pdf", "b.pdf"]);
    }
}
