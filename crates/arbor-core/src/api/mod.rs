//! Seams to the services the chat engine calls out to.

mod provider;
mod retrieval;

pub use provider::{CompletionProvider, ProviderError, UnavailableProvider};
pub use retrieval::{
    NoRetrieval, RetrievalError, RetrievalService, RetrievedChunk, cited_documents, citations_from,
};

#[cfg(any(test, feature = "test-utils"))]
pub use provider::ScriptedProvider;
#[cfg(any(test, feature = "test-utils"))]
pub use retrieval::StaticRetrieval;
