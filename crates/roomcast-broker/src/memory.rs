//! In-process broker.
//!
//! Mirrors Redis pub/sub semantics closely enough to run several gateway
//! instances inside one process: exact and pattern subscriptions, one
//! delivery per matching subscription, and a receiver count from publish.
//! [`MemoryBroker::set_available`] simulates an outage.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use globset::{GlobBuilder, GlobMatcher};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::traits::{
    Broker, BrokerError, BrokerMessage, MessageStream, Publisher, SubscriptionSink,
};

/// One subscription connection's state.
struct SubscriberSlot {
    topics: HashSet<String>,
    patterns: HashMap<String, GlobMatcher>,
    sender: mpsc::UnboundedSender<BrokerMessage>,
}

struct Inner {
    subscribers: DashMap<u64, SubscriberSlot>,
    next_id: AtomicU64,
    available: AtomicBool,
}

/// A broker living entirely in this process.
///
/// Clones share the same topic space, so every gateway built on a clone
/// sees every other gateway's publishes.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate the broker going down or coming back.
    ///
    /// Going down fails new connects and publishes, and ends every open
    /// subscription stream.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        if !available {
            self.inner.subscribers.clear();
            debug!("Memory broker unavailable, subscriptions dropped");
        } else {
            debug!("Memory broker available");
        }
    }

    /// Whether the broker currently accepts connections.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Number of open subscription connections.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("memory broker is down".to_string()))
        }
    }

    fn publish_now(&self, topic: &str, payload: &Bytes) -> Result<usize, BrokerError> {
        self.check_available()?;

        let mut delivered = 0;
        let mut closed = Vec::new();

        for slot in self.inner.subscribers.iter() {
            let mut outgoing = Vec::new();
            if slot.topics.contains(topic) {
                outgoing.push(BrokerMessage::exact(topic, payload.clone()));
            }
            for (pattern, matcher) in &slot.patterns {
                if matcher.is_match(topic) {
                    outgoing.push(BrokerMessage::matched(
                        pattern.as_str(),
                        topic,
                        payload.clone(),
                    ));
                }
            }
            for message in outgoing {
                if slot.sender.send(message).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(*slot.key());
                    break;
                }
            }
        }

        // Removal happens after iteration so no shard guard is held.
        for id in closed {
            self.inner.subscribers.remove(&id);
        }

        trace!(topic = %topic, receivers = delivered, "Memory publish");
        Ok(delivered)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect_publisher(&self) -> Result<Box<dyn Publisher>, BrokerError> {
        self.check_available()?;
        Ok(Box::new(MemoryPublisher {
            broker: self.clone(),
        }))
    }

    async fn connect_subscriber(
        &self,
    ) -> Result<(Box<dyn SubscriptionSink>, MessageStream), BrokerError> {
        self.check_available()?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.subscribers.insert(
            id,
            SubscriberSlot {
                topics: HashSet::new(),
                patterns: HashMap::new(),
                sender,
            },
        );

        let stream = stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|message| (Ok::<_, BrokerError>(message), receiver))
        })
        .boxed();

        let sink: Box<dyn SubscriptionSink> = Box::new(MemorySink {
            broker: self.clone(),
            id,
        });
        Ok((sink, stream))
    }
}

struct MemoryPublisher {
    broker: MemoryBroker,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, BrokerError> {
        self.broker.publish_now(topic, &payload)
    }
}

struct MemorySink {
    broker: MemoryBroker,
    id: u64,
}

impl MemorySink {
    fn update(&self, apply: impl FnOnce(&mut SubscriberSlot)) -> Result<(), BrokerError> {
        self.broker.check_available()?;
        let mut slot = self
            .broker
            .inner
            .subscribers
            .get_mut(&self.id)
            .ok_or(BrokerError::ConnectionClosed)?;
        apply(&mut slot);
        Ok(())
    }
}

#[async_trait]
impl SubscriptionSink for MemorySink {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.update(|slot| {
            slot.topics.insert(topic.to_string());
        })
    }

    async fn psubscribe(&mut self, pattern: &str) -> Result<(), BrokerError> {
        let matcher = compile_pattern(pattern)?;
        self.update(|slot| {
            slot.patterns.insert(pattern.to_string(), matcher);
        })
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.update(|slot| {
            slot.topics.remove(topic);
        })
    }

    async fn punsubscribe(&mut self, pattern: &str) -> Result<(), BrokerError> {
        self.update(|slot| {
            slot.patterns.remove(pattern);
        })
    }
}

/// Compile a `PSUBSCRIBE` pattern.
///
/// Redis negates classes with `[^..]` where globset uses `[!..]`, and
/// braces are plain characters to Redis.
fn compile_pattern(pattern: &str) -> Result<GlobMatcher, BrokerError> {
    let mut glob = String::with_capacity(pattern.len() + 4);
    let mut chars = pattern.chars().peekable();
    let mut in_class = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                glob.push('\\');
                if let Some(escaped) = chars.next() {
                    glob.push(escaped);
                }
            }
            '[' if !in_class => {
                in_class = true;
                glob.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    glob.push('!');
                }
            }
            ']' if in_class => {
                in_class = false;
                glob.push(']');
            }
            '{' | '}' if !in_class => {
                glob.push('[');
                glob.push(c);
                glob.push(']');
            }
            c => glob.push(c),
        }
    }

    GlobBuilder::new(&glob)
        .literal_separator(false)
        .backslash_escape(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| BrokerError::InvalidPattern(format!("{pattern}: {e}")))
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self.broker.inner.subscribers.remove(&self.id);
    }
}
