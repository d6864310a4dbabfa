//! The per-instance pub/sub bridge.
//!
//! A [`PubSubBridge`] owns one publish connection and one subscription
//! connection to a [`Broker`]. Subscriptions are served by a single
//! dispatcher task that owns the subscription connection, invokes the
//! registered handlers one message at a time, and reconnects with
//! exponential backoff when the connection drops.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{FutureExt, StreamExt};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::traits::{
    Broker, BrokerError, BrokerMessage, MessageStream, Publisher, SubscriptionSink,
};

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives messages for one subscription.
///
/// Handlers run on the dispatcher task, one message at a time. An error or
/// a panic is logged and counted; the next message is still dispatched.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message.
    async fn handle(&self, message: &BrokerMessage) -> Result<(), HandlerError>;
}

/// A registered subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    /// Exact topic.
    Exact(String),
    /// Glob pattern.
    Pattern(String),
}

impl Subscription {
    /// The subscription a received message was delivered through.
    #[must_use]
    pub fn for_message(message: &BrokerMessage) -> Self {
        match &message.pattern {
            Some(pattern) => Subscription::Pattern(pattern.clone()),
            None => Subscription::Exact(message.topic.clone()),
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscription::Exact(topic) => write!(f, "topic {topic}"),
            Subscription::Pattern(pattern) => write!(f, "pattern {pattern}"),
        }
    }
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Connection attempts made by [`PubSubBridge::start`] before giving up.
    pub startup_attempts: u32,
    /// First backoff delay, doubled after each failed attempt.
    pub reconnect_delay: Duration,
    /// Upper bound for the backoff delay.
    pub max_reconnect_delay: Duration,
    /// Limit for a single connection attempt.
    pub connect_timeout: Duration,
    /// Limit for a single publish, after which the publish connection is
    /// treated as stalled.
    pub publish_timeout: Duration,
    /// Capacity of the dispatcher's command queue.
    pub command_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            startup_attempts: 5,
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(5),
            command_buffer: 64,
        }
    }
}

/// Subscription-side connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    /// Nothing connected yet.
    Idle,
    /// The dispatcher is receiving messages.
    Connected,
    /// The subscription connection was lost and is being re-established.
    Reconnecting,
    /// [`PubSubBridge::shutdown`] was called.
    Closed,
}

impl BridgeStatus {
    /// Lowercase name for health output.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeStatus::Idle => "idle",
            BridgeStatus::Connected => "connected",
            BridgeStatus::Reconnecting => "reconnecting",
            BridgeStatus::Closed => "closed",
        }
    }
}

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Startup gave up.
    #[error("Broker unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    /// The bridge was shut down.
    #[error("Bridge is closed")]
    Closed,

    /// A broker operation failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Counters exposed for health and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeStats {
    /// Messages handed to a handler.
    pub dispatched: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
    /// Successful subscription reconnects.
    pub reconnects: u64,
    /// Publishes that failed.
    pub publish_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    handler_failures: AtomicU64,
    reconnects: AtomicU64,
    publish_failures: AtomicU64,
}

type HandlerMap = Arc<DashMap<Subscription, Arc<dyn MessageHandler>>>;

enum Command {
    Apply {
        subscription: Subscription,
        subscribe: bool,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    Shutdown,
}

struct DispatcherHandle {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// Publish/subscribe bridge for one gateway instance.
pub struct PubSubBridge {
    broker: Arc<dyn Broker>,
    config: BridgeConfig,
    handlers: HandlerMap,
    publisher: Mutex<Option<Arc<dyn Publisher>>>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
    status: Arc<watch::Sender<BridgeStatus>>,
    counters: Arc<Counters>,
    closed: AtomicBool,
}

impl PubSubBridge {
    /// Create a bridge. Nothing connects until [`start`](Self::start) or
    /// the first publish or subscribe.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, config: BridgeConfig) -> Self {
        let (status, _) = watch::channel(BridgeStatus::Idle);
        Self {
            broker,
            config,
            handlers: Arc::new(DashMap::new()),
            publisher: Mutex::new(None),
            dispatcher: Mutex::new(None),
            status: Arc::new(status),
            counters: Arc::new(Counters::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Name of the underlying broker.
    #[must_use]
    pub fn broker_name(&self) -> &'static str {
        self.broker.name()
    }

    /// Current subscription-side status.
    #[must_use]
    pub fn status(&self) -> BridgeStatus {
        *self.status.borrow()
    }

    /// Watch status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<BridgeStatus> {
        self.status.subscribe()
    }

    /// Snapshot of the bridge counters.
    #[must_use]
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
        }
    }

    /// Whether a handler is registered for the subscription.
    #[must_use]
    pub fn is_subscribed(&self, subscription: &Subscription) -> bool {
        self.handlers.contains_key(subscription)
    }

    /// Connect both halves, retrying with backoff.
    ///
    /// Calling this on a connected bridge is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Unavailable`] once `startup_attempts` attempts
    /// have failed, or [`BridgeError::Closed`] after shutdown.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let attempts = self.config.startup_attempts.max(1);
        let mut delay = self.config.reconnect_delay;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let source = match self.connect().await {
                Ok(()) => {
                    info!(broker = self.broker.name(), attempt, "Pub/sub bridge connected");
                    return Ok(());
                }
                Err(BridgeError::Broker(source)) => source,
                Err(e) => return Err(e),
            };

            if attempt >= attempts {
                error!(broker = self.broker.name(), attempts, error = %source, "Giving up on broker");
                return Err(BridgeError::Unavailable { attempts, source });
            }

            warn!(
                broker = self.broker.name(),
                attempt,
                error = %source,
                retry_in = ?delay,
                "Broker connection failed"
            );
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.config.max_reconnect_delay);
        }
    }

    /// Connect both halves once. Already-open halves are reused.
    ///
    /// # Errors
    ///
    /// Returns an error if either connection cannot be opened.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.publisher().await?;
        self.commands().await?;
        Ok(())
    }

    /// Publish a payload.
    ///
    /// Returns the broker's receiver count. A failure drops the publish
    /// connection so the next call reconnects; the payload is not retried.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker cannot be reached or rejects the
    /// publish, or the bridge is closed.
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, BridgeError> {
        self.ensure_open()?;

        let publisher = match self.publisher().await {
            Ok(publisher) => publisher,
            Err(e) => {
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let published =
            tokio::time::timeout(self.config.publish_timeout, publisher.publish(topic, payload))
                .await
                .unwrap_or(Err(BrokerError::Timeout));

        match published {
            Ok(receivers) => {
                trace!(topic = %topic, receivers, "Published");
                Ok(receivers)
            }
            Err(e) => {
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                let mut slot = self.publisher.lock().await;
                if slot
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &publisher))
                {
                    *slot = None;
                }
                warn!(topic = %topic, error = %e, "Publish failed, publish connection dropped");
                Err(e.into())
            }
        }
    }

    /// Register a handler for an exact topic.
    ///
    /// Registering the same topic again replaces the handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the subscription.
    pub async fn subscribe_exact(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BridgeError> {
        self.register(Subscription::Exact(topic.into()), handler)
            .await
    }

    /// Register a handler for a glob pattern.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the subscription.
    pub async fn subscribe_pattern(
        &self,
        pattern: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BridgeError> {
        self.register(Subscription::Pattern(pattern.into()), handler)
            .await
    }

    /// Remove an exact-topic handler. No-op when not subscribed.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the unsubscribe.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), BridgeError> {
        self.deregister(Subscription::Exact(topic.to_string()))
            .await
    }

    /// Remove a pattern handler. No-op when not subscribed.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the unsubscribe.
    pub async fn unsubscribe_pattern(&self, pattern: &str) -> Result<(), BridgeError> {
        self.deregister(Subscription::Pattern(pattern.to_string()))
            .await
    }

    /// Stop the dispatcher and drop both connections. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let handle = self.dispatcher.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.commands.send(Command::Shutdown).await;
            if let Err(e) = handle.task.await {
                warn!(error = %e, "Dispatcher task ended abnormally");
            }
        }

        self.publisher.lock().await.take();
        self.handlers.clear();
        self.status.send_replace(BridgeStatus::Closed);
        info!(broker = self.broker.name(), "Pub/sub bridge shut down");
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BridgeError::Closed)
        } else {
            Ok(())
        }
    }

    async fn with_timeout<T>(
        &self,
        connect: impl Future<Output = Result<T, BrokerError>>,
    ) -> Result<T, BrokerError> {
        tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| BrokerError::Timeout)?
    }

    async fn publisher(&self) -> Result<Arc<dyn Publisher>, BridgeError> {
        let mut slot = self.publisher.lock().await;
        if let Some(publisher) = slot.as_ref() {
            return Ok(Arc::clone(publisher));
        }

        let publisher: Arc<dyn Publisher> =
            Arc::from(self.with_timeout(self.broker.connect_publisher()).await?);
        *slot = Some(Arc::clone(&publisher));
        debug!(broker = self.broker.name(), "Publish connection opened");
        Ok(publisher)
    }

    async fn commands(&self) -> Result<mpsc::Sender<Command>, BridgeError> {
        let mut slot = self.dispatcher.lock().await;
        self.ensure_open()?;

        if let Some(handle) = slot.as_ref() {
            if !handle.task.is_finished() {
                return Ok(handle.commands.clone());
            }
        }

        let (sink, stream) = self.with_timeout(self.broker.connect_subscriber()).await?;
        let (commands, receiver) = mpsc::channel(self.config.command_buffer.max(1));

        let dispatcher = Dispatcher {
            broker: Arc::clone(&self.broker),
            handlers: Arc::clone(&self.handlers),
            commands: receiver,
            status: Arc::clone(&self.status),
            counters: Arc::clone(&self.counters),
            config: self.config.clone(),
        };
        let task = tokio::spawn(dispatcher.run(sink, stream));

        self.status.send_replace(BridgeStatus::Connected);
        debug!(broker = self.broker.name(), "Subscription connection opened");

        *slot = Some(DispatcherHandle {
            commands: commands.clone(),
            task,
        });
        Ok(commands)
    }

    async fn register(
        &self,
        subscription: Subscription,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BridgeError> {
        self.ensure_open()?;
        let commands = self.commands().await?;

        self.handlers.insert(subscription.clone(), handler);
        match send_command(&commands, subscription.clone(), true).await {
            Ok(()) => {
                debug!(subscription = %subscription, "Handler registered");
                Ok(())
            }
            Err(e) => {
                self.handlers.remove(&subscription);
                Err(e)
            }
        }
    }

    async fn deregister(&self, subscription: Subscription) -> Result<(), BridgeError> {
        if self.handlers.remove(&subscription).is_none() {
            return Ok(());
        }

        let commands = {
            let slot = self.dispatcher.lock().await;
            slot.as_ref()
                .filter(|handle| !handle.task.is_finished())
                .map(|handle| handle.commands.clone())
        };

        match commands {
            Some(commands) => {
                send_command(&commands, subscription.clone(), false).await?;
                debug!(subscription = %subscription, "Handler removed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

async fn send_command(
    commands: &mpsc::Sender<Command>,
    subscription: Subscription,
    subscribe: bool,
) -> Result<(), BridgeError> {
    let (reply, response) = oneshot::channel();
    commands
        .send(Command::Apply {
            subscription,
            subscribe,
            reply,
        })
        .await
        .map_err(|_| BridgeError::Closed)?;
    response.await.map_err(|_| BridgeError::Closed)??;
    Ok(())
}

async fn apply(
    sink: &mut dyn SubscriptionSink,
    subscription: &Subscription,
    subscribe: bool,
) -> Result<(), BrokerError> {
    match (subscription, subscribe) {
        (Subscription::Exact(topic), true) => sink.subscribe(topic).await,
        (Subscription::Pattern(pattern), true) => sink.psubscribe(pattern).await,
        (Subscription::Exact(topic), false) => sink.unsubscribe(topic).await,
        (Subscription::Pattern(pattern), false) => sink.punsubscribe(pattern).await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

enum Exit {
    Shutdown,
    ConnectionLost(String),
}

/// The task owning the subscription connection.
struct Dispatcher {
    broker: Arc<dyn Broker>,
    handlers: HandlerMap,
    commands: mpsc::Receiver<Command>,
    status: Arc<watch::Sender<BridgeStatus>>,
    counters: Arc<Counters>,
    config: BridgeConfig,
}

impl Dispatcher {
    async fn run(mut self, mut sink: Box<dyn SubscriptionSink>, mut stream: MessageStream) {
        // Non-empty only when a previous dispatcher died.
        if let Err(e) = self.resubscribe(sink.as_mut()).await {
            warn!(error = %e, "Failed to restore subscriptions");
        }

        loop {
            match self.pump(sink.as_mut(), &mut stream).await {
                Exit::Shutdown => break,
                Exit::ConnectionLost(reason) => {
                    warn!(broker = self.broker.name(), reason = %reason, "Subscription connection lost");
                    self.status.send_replace(BridgeStatus::Reconnecting);

                    match self.reconnect().await {
                        Some((new_sink, new_stream)) => {
                            sink = new_sink;
                            stream = new_stream;
                            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                            self.status.send_replace(BridgeStatus::Connected);
                            info!(broker = self.broker.name(), "Subscription connection restored");
                        }
                        None => break,
                    }
                }
            }
        }

        debug!("Dispatcher stopped");
    }

    async fn pump(&mut self, sink: &mut dyn SubscriptionSink, stream: &mut MessageStream) -> Exit {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Apply { subscription, subscribe, reply }) => {
                        let result = apply(sink, &subscription, subscribe).await;
                        let failure = result.as_ref().err().map(ToString::to_string);
                        let _ = reply.send(result);
                        if let Some(reason) = failure {
                            return Exit::ConnectionLost(reason);
                        }
                    }
                    Some(Command::Shutdown) | None => return Exit::Shutdown,
                },
                message = stream.next() => match message {
                    Some(Ok(message)) => self.dispatch(message).await,
                    Some(Err(e)) => return Exit::ConnectionLost(e.to_string()),
                    None => return Exit::ConnectionLost("subscription stream ended".to_string()),
                },
            }
        }
    }

    async fn dispatch(&self, message: BrokerMessage) {
        let subscription = Subscription::for_message(&message);
        let handler = self
            .handlers
            .get(&subscription)
            .map(|entry| Arc::clone(entry.value()));

        let Some(handler) = handler else {
            trace!(topic = %message.topic, "No handler for message");
            return;
        };

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        match AssertUnwindSafe(handler.handle(&message)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!(topic = %message.topic, subscription = %subscription, error = %e, "Handler failed");
            }
            Err(panic) => {
                self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    topic = %message.topic,
                    subscription = %subscription,
                    panic = panic_message(panic.as_ref()),
                    "Handler panicked"
                );
            }
        }
    }

    async fn reconnect(&mut self) -> Option<(Box<dyn SubscriptionSink>, MessageStream)> {
        let mut delay = self.config.reconnect_delay;

        loop {
            if !self.wait(delay).await {
                return None;
            }

            match tokio::time::timeout(self.config.connect_timeout, self.broker.connect_subscriber())
                .await
            {
                Ok(Ok((mut sink, stream))) => match self.resubscribe(sink.as_mut()).await {
                    Ok(()) => return Some((sink, stream)),
                    Err(e) => warn!(error = %e, "Failed to restore subscriptions"),
                },
                Ok(Err(e)) => warn!(error = %e, retry_in = ?delay, "Reconnect failed"),
                Err(_) => warn!(retry_in = ?delay, "Reconnect timed out"),
            }

            delay = (delay * 2).min(self.config.max_reconnect_delay);
        }
    }

    /// Sleep while still answering commands. Returns `false` on shutdown.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    // The handler map already reflects the change; the
                    // reconnect resubscribes from it.
                    Some(Command::Apply { reply, .. }) => {
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Shutdown) | None => return false,
                },
            }
        }
    }

    async fn resubscribe(&self, sink: &mut dyn SubscriptionSink) -> Result<(), BrokerError> {
        let subscriptions: Vec<Subscription> = self
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for subscription in &subscriptions {
            apply(sink, subscription, true).await?;
        }

        if !subscriptions.is_empty() {
            info!(count = subscriptions.len(), "Subscriptions restored");
        }
        Ok(())
    }
}
