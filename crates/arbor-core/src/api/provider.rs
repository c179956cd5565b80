use async_trait::async_trait;
use thiserror::Error;

use crate::domain::Turn;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Completion provider unavailable: {0}")]
    Unavailable(String),
    #[error("Completion request failed: {0}")]
    Request(String),
    #[error("Completion provider returned an empty reply")]
    EmptyReply,
    #[error("Completion timed out after {0} seconds")]
    Timeout(u64),
}

/// Generates the assistant reply for a lineage of turns.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, turns: &[Turn]) -> Result<String, ProviderError>;
}

/// Provider used when no model is configured. Every call fails, so callers
/// fall back to their canned reply.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableProvider;

#[async_trait]
impl CompletionProvider for UnavailableProvider {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn generate(&self, _turns: &[Turn]) -> Result<String, ProviderError> {
        Err(ProviderError::Unavailable(
            "no completion provider configured".to_string(),
        ))
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use scripted::ScriptedProvider;

#[cfg(any(test, feature = "test-utils"))]
mod scripted {
    use super::{CompletionProvider, ProviderError};
    use crate::domain::Turn;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays queued replies and records what it was asked.
    #[derive(Default)]
    pub struct ScriptedProvider {
        replies: Mutex<VecDeque<Result<String, String>>>,
        calls: Mutex<Vec<Vec<Turn>>>,
        delay: Option<Duration>,
    }

    impl ScriptedProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn replying(replies: impl IntoIterator<Item = &'static str>) -> Self {
            let provider = Self::new();
            for reply in replies {
                provider.push_reply(reply);
            }
            provider
        }

        /// Sleeps before answering, to exercise timeouts.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn push_reply(&self, reply: impl Into<String>) {
            if let Ok(mut replies) = self.replies.lock() {
                replies.push_back(Ok(reply.into()));
            }
        }

        pub fn push_failure(&self, message: impl Into<String>) {
            if let Ok(mut replies) = self.replies.lock() {
                replies.push_back(Err(message.into()));
            }
        }

        pub fn calls(&self) -> Vec<Vec<Turn>> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, turns: &[Turn]) -> Result<String, ProviderError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(turns.to_vec());
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self
                .replies
                .lock()
                .map_err(|_| ProviderError::Request("script lock poisoned".to_string()))?
                .pop_front();
            match next {
                Some(Ok(reply)) => Ok(reply),
                Some(Err(message)) => Err(ProviderError::Request(message)),
                None => Err(ProviderError::Unavailable("script exhausted".to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Role;

    #[tokio::test]
    async fn unavailable_provider_always_fails() {
        let err = UnavailableProvider.generate(&[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn scripted_provider_replays_in_order() {
        let provider = ScriptedProvider::replying(["one"]);
        provider.push_failure("boom");
        let turn = Turn {
            role: Role::User,
            content: "hi".to_string(),
        };

        assert_eq!(provider.generate(&[turn.clone()]).await.unwrap(), "one");
        assert!(matches!(
            provider.generate(&[]).await,
            Err(ProviderError::Request(_))
        ));
        assert!(matches!(
            provider.generate(&[]).await,
            Err(ProviderError::Unavailable(_))
        ));
        assert_eq!(provider.calls()[0], vec![turn]);
    }
}
