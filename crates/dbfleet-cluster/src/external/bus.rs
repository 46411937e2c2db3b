//! Broadcast bus contract. The bus itself (pubsub transport) is out of
//! scope; only a publish/subscribe interface is assumed.

use crate::error::Result;
use crate::messages::MetadataMessage;
use async_trait::async_trait;

/// A handler invoked for every message received on a subscribed topic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &str, message: MetadataMessage);
}

/// At-least-once, unordered publish/subscribe transport.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, topic: &str, message: &MetadataMessage) -> Result<()>;

    async fn subscribe(&self, topic: &str, handler: std::sync::Arc<dyn MessageHandler>)
        -> Result<()>;
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// An in-process fake bus used to wire multiple cluster managers
    /// together in tests without a real transport.
    #[derive(Default)]
    pub struct InMemoryBus {
        handlers: Mutex<HashMap<String, Vec<Arc<dyn MessageHandler>>>>,
    }

    impl InMemoryBus {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    #[async_trait]
    impl Bus for InMemoryBus {
        async fn publish(&self, topic: &str, message: &MetadataMessage) -> Result<()> {
            let handlers = {
                let guard = self.handlers.lock();
                guard.get(topic).cloned().unwrap_or_default()
            };
            for handler in handlers {
                handler.handle(topic, message.clone()).await;
            }
            Ok(())
        }

        async fn subscribe(
            &self,
            topic: &str,
            handler: Arc<dyn MessageHandler>,
        ) -> Result<()> {
            self.handlers
                .lock()
                .entry(topic.to_string())
                .or_default()
                .push(handler);
            Ok(())
        }
    }
}
