use crate::connection::Outbox;
use crate::error::{Result, TesiraError};
use crate::protocol::{publish_token, AttributeCode, CommandLine, CommandValue, Verb};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Receiver for block, channel, status or message events
pub struct EventReceiver<T> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> EventReceiver<T> {
    pub(crate) fn new(rx: broadcast::Receiver<T>) -> Self {
        Self { rx }
    }

    /// Receive the next event
    ///
    /// Returns [`TesiraError::ConnectionClosed`] once every sender is gone.
    pub async fn recv(&mut self) -> Result<T> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => TesiraError::ConnectionClosed,
            broadcast::error::RecvError::Lagged(n) => {
                TesiraError::ChannelError(format!("Lagged by {} messages", n))
            }
        })
    }

    /// Try to receive an event without blocking
    ///
    /// Returns `None` if no event is available.
    pub fn try_recv(&mut self) -> Result<Option<T>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(TesiraError::ConnectionClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(TesiraError::ChannelError(format!("Lagged by {} messages", n)))
            }
        }
    }
}

/// Publish tokens a block has subscribed
///
/// The table survives reconnects; the device forgets subscriptions when the
/// session drops, so [`resubscribe`](SubscriptionSet::resubscribe) resends
/// every entry.
#[derive(Debug, Clone)]
pub struct SubscriptionSet {
    instance_tag: String,
    rate_ms: u32,
    tokens: BTreeMap<String, AttributeCode>,
}

impl SubscriptionSet {
    pub fn new(instance_tag: impl Into<String>, rate_ms: u32) -> Self {
        Self {
            instance_tag: instance_tag.into(),
            rate_ms,
            tokens: BTreeMap::new(),
        }
    }

    /// Record a subscription and send it when connected
    pub fn subscribe(&mut self, attribute: AttributeCode, outbox: &Outbox) -> String {
        let token = publish_token(&self.instance_tag, attribute);
        self.tokens.insert(token.clone(), attribute);
        if outbox.is_connected() {
            self.send_subscribe(&token, attribute, outbox);
        }
        token
    }

    /// Forget a subscription, telling the device when connected
    pub fn unsubscribe(&mut self, token: &str, outbox: &Outbox) {
        let Some(attribute) = self.tokens.remove(token) else {
            tracing::debug!("{}: not subscribed to {}", self.instance_tag, token);
            return;
        };
        if outbox.is_connected() {
            let line = self.unsubscribe_command(attribute, token);
            if let Err(e) = outbox.send_command(&line) {
                tracing::warn!("{}: could not unsubscribe {}: {}", self.instance_tag, token, e);
            }
        }
    }

    pub fn unsubscribe_all(&mut self, outbox: &Outbox) {
        let tokens: Vec<String> = self.tokens.keys().cloned().collect();
        for token in tokens {
            self.unsubscribe(&token, outbox);
        }
    }

    /// Resend every recorded subscription
    pub fn resubscribe(&self, outbox: &Outbox) {
        for (token, attribute) in &self.tokens {
            self.send_subscribe(token, *attribute, outbox);
        }
    }

    fn send_subscribe(&self, token: &str, attribute: AttributeCode, outbox: &Outbox) {
        let line = self.subscribe_command(attribute, token);
        if let Err(e) = outbox.send_command(&line) {
            tracing::warn!("{}: could not subscribe {}: {}", self.instance_tag, token, e);
        }
    }

    /// `<tag> subscribe <attr> "<token>" <rate>`
    pub fn subscribe_command(&self, attribute: AttributeCode, token: &str) -> CommandLine {
        CommandLine::new(&self.instance_tag, Verb::Subscribe)
            .with_attribute(attribute)
            .with_value(CommandValue::Text(token.to_string()))
            .with_value(CommandValue::Int(i64::from(self.rate_ms)))
    }

    /// `<tag> unsubscribe <attr> "<token>"`
    pub fn unsubscribe_command(&self, attribute: AttributeCode, token: &str) -> CommandLine {
        CommandLine::new(&self.instance_tag, Verb::Unsubscribe)
            .with_attribute(attribute)
            .with_value(CommandValue::Text(token.to_string()))
    }

    /// Attribute subscribed under `token`
    pub fn attribute_for(&self, token: &str) -> Option<AttributeCode> {
        self.tokens.get(token).copied()
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.tokens.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// A closure scheduled to run once after a delay
///
/// Dropping or cancelling the task before the delay elapses means the closure
/// never runs.
pub struct DeferredTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl DeferredTask {
    pub fn schedule<F>(delay: Duration, task: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => task(),
                _ = token.cancelled() => {}
            }
        });
        Self { cancel, handle }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once the closure ran or the task was cancelled
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for DeferredTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
