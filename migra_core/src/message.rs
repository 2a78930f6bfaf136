//! Progress reporting: [`Message`]s produced by a running batch and the bounded
//! [`MessageStream`] the caller drains.

use crate::coordinator::ApplyError;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::ReceiverStream;

/// What a [`Message`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Another entry holds the turn.
    Waiting,
    /// The forward script was applied.
    Applied,
    /// The migration failed; the batch policy applies.
    Failed,
    /// The migration was not registered because its name is already taken.
    Skipped,
    /// An earlier migration of the batch was unwound.
    RolledBack,
    /// Unwinding an earlier migration failed.
    RollbackFailed,
    /// The batch was cancelled while waiting for its turn.
    Cancelled,
}

/// One progress event. Not persisted.
#[derive(Debug, Clone)]
pub struct Message {
    /// What happened.
    pub kind: MessageKind,
    /// The migration this message is about.
    pub migration: Option<String>,
    /// Human readable description.
    pub info: String,
    /// When the event happened.
    pub time: DateTime<Utc>,
    /// The error behind a failure outcome.
    pub error: Option<Arc<ApplyError>>,
}

impl Message {
    /// Creates a message stamped with the current time.
    pub fn new(kind: MessageKind, info: impl Into<String>) -> Self {
        Self {
            kind,
            migration: None,
            info: info.into(),
            time: Utc::now(),
            error: None,
        }
    }

    /// Attaches the migration name.
    pub fn for_migration(mut self, name: impl Into<String>) -> Self {
        self.migration = Some(name.into());
        self
    }

    /// Attaches the error behind this message.
    pub fn with_error(mut self, error: ApplyError) -> Self {
        self.error = Some(Arc::new(error));
        self
    }

    /// Whether this message reports an outcome the operator has to act on.
    pub fn is_error(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::Failed | MessageKind::RollbackFailed | MessageKind::Cancelled
        )
    }

    pub(crate) fn waiting(name: &str) -> Self {
        Message::new(MessageKind::Waiting, "Waiting").for_migration(name)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.time.format("%Y-%m-%d %H:%M:%S"))?;
        if let Some(name) = &self.migration {
            write!(f, " {name}:")?;
        }
        write!(f, " {}", self.info)?;
        if let Some(error) = &self.error {
            write!(f, " ({error})")?;
        }
        Ok(())
    }
}

/// Producer half of the progress channel.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<Message>,
}

impl ProgressSender {
    /// Sends a message, waiting for capacity when the consumer is behind.
    ///
    /// A consumer that dropped its stream does not stop the batch; the message is discarded.
    pub async fn send(&self, message: Message) {
        if let Err(mpsc::error::SendError(message)) = self.tx.send(message).await {
            log::debug!("Progress stream dropped, discarding message: {}", message);
        }
    }
}

/// The finite, closeable sequence of progress messages of one batch. Closes after the last
/// message of the batch.
#[derive(Debug)]
pub struct MessageStream {
    inner: ReceiverStream<Message>,
}

impl MessageStream {
    /// Waits for the next message. `None` once the batch is over.
    pub async fn next_message(&mut self) -> Option<Message> {
        self.inner.next().await
    }

    /// Drains the stream until it closes.
    pub async fn collect_all(mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some(message) = self.next_message().await {
            messages.push(message);
        }
        messages
    }
}

impl Stream for MessageStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Creates a bounded progress channel.
pub fn progress_channel(capacity: usize) -> (ProgressSender, MessageStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ProgressSender { tx },
        MessageStream {
            inner: ReceiverStream::new(rx),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn stream_closes_when_sender_is_dropped() {
        let (sender, stream) = progress_channel(4);
        sender
            .send(Message::new(MessageKind::Applied, "Applied").for_migration("m1"))
            .await;
        drop(sender);

        let messages: Vec<Message> = stream.collect().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Applied);
        assert_eq!(messages[0].migration.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn bounded_channel_applies_backpressure() {
        let (sender, mut stream) = progress_channel(1);
        sender.send(Message::waiting("m1")).await;

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            sender.send(Message::waiting("m1")),
        )
        .await;
        assert!(blocked.is_err(), "second send should wait for the consumer");

        assert!(stream.next_message().await.is_some());
    }

    #[tokio::test]
    async fn sending_after_consumer_dropped_does_not_fail() {
        let (sender, stream) = progress_channel(1);
        drop(stream);
        sender.send(Message::waiting("m1")).await;
    }

    #[test]
    fn display_includes_name_and_error() {
        let message = Message::new(MessageKind::Failed, "Failed")
            .for_migration("m2")
            .with_error(ApplyError::AlreadyExists("m2".into()));
        let text = message.to_string();
        assert!(text.contains("m2: Failed"));
        assert!(text.contains("already exists"));
        assert!(message.is_error());
    }
}
