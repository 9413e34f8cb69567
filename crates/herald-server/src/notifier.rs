use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use herald_config::Outbound;
use herald_contracts::{ChoiceSet, ConversationId, MessageRef};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::registry::Registry;

/// Outbound side of the chat platform.
#[async_trait]
pub trait ChatTransport: Send + Sync + 'static {
    /// Sends plain text, with one button per choice when `choices` has any.
    async fn send_text(
        &self,
        conversation: ConversationId,
        text: &str,
        choices: Option<&ChoiceSet>,
    ) -> Result<MessageRef, TransportError>;

    /// Replaces the text of an existing message and drops its buttons.
    async fn edit_text(&self, message: MessageRef, text: &str) -> Result<(), TransportError>;

    async fn send_file(
        &self,
        conversation: ConversationId,
        path: &Path,
        caption: &str,
    ) -> Result<MessageRef, TransportError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &Outbound) -> Self {
        Self {
            max_attempts: cfg.retry_max_attempts.max(1),
            backoff: Duration::from_millis(cfg.retry_backoff_ms),
            backoff_max: Duration::from_millis(cfg.retry_backoff_max_ms),
        }
    }

    /// Delay after the `attempt`-th failure (0-based), doubling up to the cap.
    pub fn delay(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.backoff.saturating_mul(factor).min(self.backoff_max)
    }
}

async fn with_retry<T, F, Fut>(policy: RetryPolicy, op: &str, mut call: F) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut last = String::new();
    for attempt in 0..policy.max_attempts {
        match call().await {
            Ok(value) => return Ok(value),
            Err(TransportError::Retryable(reason)) => {
                warn!(op, attempt = attempt + 1, %reason, "transport call failed");
                last = reason;
                if attempt + 1 < policy.max_attempts && policy.backoff > Duration::ZERO {
                    sleep(policy.delay(attempt)).await;
                }
            }
            Err(other) => return Err(other),
        }
    }
    Err(TransportError::Exhausted {
        attempts: policy.max_attempts,
        last,
    })
}

type Reply<T> = oneshot::Sender<Result<T, TransportError>>;

enum Job {
    Send {
        text: String,
        choices: Option<ChoiceSet>,
        reply: Reply<MessageRef>,
    },
    Edit {
        message: MessageRef,
        text: String,
        reply: Reply<()>,
    },
    Ticker {
        text: String,
        reply: Reply<MessageRef>,
    },
    ClearTicker {
        reply: Reply<Option<MessageRef>>,
    },
    File {
        path: PathBuf,
        caption: String,
        reply: Reply<MessageRef>,
    },
}

struct Shared {
    transport: Arc<dyn ChatTransport>,
    retry: RetryPolicy,
    registry: Registry,
    workers: Mutex<Option<HashMap<ConversationId, mpsc::UnboundedSender<Job>>>>,
    tracker: TaskTracker,
}

/// Serializes outbound traffic per conversation; one worker task each.
#[derive(Clone)]
pub struct Notifier {
    shared: Arc<Shared>,
}

impl Notifier {
    pub fn new(transport: Arc<dyn ChatTransport>, retry: RetryPolicy, registry: Registry) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                retry,
                registry,
                workers: Mutex::new(Some(HashMap::new())),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub async fn send(&self, conversation: ConversationId, text: &str) -> Result<MessageRef, TransportError> {
        self.submit(conversation, |reply| Job::Send {
            text: text.to_string(),
            choices: None,
            reply,
        })
        .await
    }

    /// Sends a request prompt and records the carrying message on the request.
    pub async fn send_with_choices(
        &self,
        conversation: ConversationId,
        text: &str,
        choices: ChoiceSet,
    ) -> Result<MessageRef, TransportError> {
        self.submit(conversation, |reply| Job::Send {
            text: text.to_string(),
            choices: Some(choices),
            reply,
        })
        .await
    }

    pub async fn edit(&self, message: MessageRef, text: &str) -> Result<(), TransportError> {
        self.submit(message.conversation, |reply| Job::Edit {
            message,
            text: text.to_string(),
            reply,
        })
        .await
    }

    /// Edits the conversation's status message in place, or starts a new one.
    pub async fn update_ticker(
        &self,
        conversation: ConversationId,
        text: &str,
    ) -> Result<MessageRef, TransportError> {
        self.submit(conversation, |reply| Job::Ticker {
            text: text.to_string(),
            reply,
        })
        .await
    }

    pub async fn clear_ticker(
        &self,
        conversation: ConversationId,
    ) -> Result<Option<MessageRef>, TransportError> {
        self.submit(conversation, |reply| Job::ClearTicker { reply })
            .await
    }

    pub async fn send_artifact(
        &self,
        conversation: ConversationId,
        path: &Path,
        caption: &str,
    ) -> Result<MessageRef, TransportError> {
        self.submit(conversation, |reply| Job::File {
            path: path.to_path_buf(),
            caption: caption.to_string(),
            reply,
        })
        .await
    }

    /// Stops accepting jobs and waits for queued ones to drain.
    pub async fn shutdown(&self) {
        let workers = self.shared.workers.lock().take();
        let count = workers.as_ref().map(HashMap::len).unwrap_or_default();
        drop(workers);
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        info!(workers = count, "notifier drained");
    }

    async fn submit<T>(
        &self,
        conversation: ConversationId,
        build: impl FnOnce(Reply<T>) -> Job,
    ) -> Result<T, TransportError> {
        let (reply, rx) = oneshot::channel();
        let job = build(reply);
        {
            let mut workers = self.shared.workers.lock();
            let Some(workers) = workers.as_mut() else {
                return Err(TransportError::Stopped);
            };
            let sender = workers
                .entry(conversation)
                .or_insert_with(|| self.spawn_worker(conversation));
            if let Err(mpsc::error::SendError(job)) = sender.send(job) {
                // Worker exited; replace it and hand over the job.
                let fresh = self.spawn_worker(conversation);
                let _ = fresh.send(job);
                *sender = fresh;
            }
        }
        rx.await.unwrap_or(Err(TransportError::Stopped))
    }

    fn spawn_worker(&self, conversation: ConversationId) -> mpsc::UnboundedSender<Job> {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            conversation,
            transport: Arc::clone(&self.shared.transport),
            retry: self.shared.retry,
            registry: self.shared.registry.clone(),
            ticker: None,
        };
        self.shared.tracker.spawn(worker.run(rx));
        debug!(%conversation, "notifier worker started");
        tx
    }
}

struct Worker {
    conversation: ConversationId,
    transport: Arc<dyn ChatTransport>,
    retry: RetryPolicy,
    registry: Registry,
    ticker: Option<MessageRef>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.recv().await {
            match job {
                Job::Send {
                    text,
                    choices,
                    reply,
                } => {
                    let result = self.send_text(&text, choices.as_ref()).await;
                    if let (Ok(message), Some(choices)) = (&result, &choices) {
                        self.registry
                            .attach_message(&choices.request_id, *message);
                    }
                    let _ = reply.send(result);
                }
                Job::Edit {
                    message,
                    text,
                    reply,
                } => {
                    let _ = reply.send(self.edit_text(message, &text).await);
                }
                Job::Ticker { text, reply } => {
                    let result = self.update_ticker(&text).await;
                    let _ = reply.send(result);
                }
                Job::ClearTicker { reply } => {
                    let _ = reply.send(Ok(self.ticker.take()));
                }
                Job::File {
                    path,
                    caption,
                    reply,
                } => {
                    let transport = &self.transport;
                    let conversation = self.conversation;
                    let path = path.as_path();
                    let caption = caption.as_str();
                    let result = with_retry(self.retry, "send_file", move || {
                        transport.send_file(conversation, path, caption)
                    })
                    .await;
                    let _ = reply.send(result);
                }
            }
        }
        debug!(conversation = %self.conversation, "notifier worker stopped");
    }

    async fn send_text(
        &self,
        text: &str,
        choices: Option<&ChoiceSet>,
    ) -> Result<MessageRef, TransportError> {
        let transport = &self.transport;
        let conversation = self.conversation;
        with_retry(self.retry, "send_text", move || {
            transport.send_text(conversation, text, choices)
        })
        .await
    }

    async fn edit_text(&self, message: MessageRef, text: &str) -> Result<(), TransportError> {
        let transport = &self.transport;
        with_retry(self.retry, "edit_text", move || transport.edit_text(message, text)).await
    }

    async fn update_ticker(&mut self, text: &str) -> Result<MessageRef, TransportError> {
        if let Some(existing) = self.ticker {
            match self.edit_text(existing, text).await {
                Ok(()) => return Ok(existing),
                Err(err) => {
                    warn!(conversation = %self.conversation, error = %err, "ticker edit failed, sending a new status message");
                }
            }
        }
        let message = self.send_text(text, None).await?;
        self.ticker = Some(message);
        Ok(message)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Sent {
        Text {
            conversation: ConversationId,
            message_id: i32,
            text: String,
            choices: Option<ChoiceSet>,
        },
        Edit {
            message: MessageRef,
            text: String,
        },
        File {
            conversation: ConversationId,
            path: PathBuf,
            caption: String,
        },
    }

    /// In-memory transport that records traffic and can be told to fail.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<Sent>>,
        pub failures: Mutex<VecDeque<TransportError>>,
        next_id: Mutex<i32>,
    }

    impl RecordingTransport {
        pub fn fail_next(&self, err: TransportError) {
            self.failures.lock().push_back(err);
        }

        pub fn sent(&self) -> Vec<Sent> {
            self.sent.lock().clone()
        }

        fn failure(&self) -> Option<TransportError> {
            self.failures.lock().pop_front()
        }

        fn next_id(&self) -> i32 {
            let mut id = self.next_id.lock();
            *id += 1;
            *id
        }
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send_text(
            &self,
            conversation: ConversationId,
            text: &str,
            choices: Option<&ChoiceSet>,
        ) -> Result<MessageRef, TransportError> {
            if let Some(err) = self.failure() {
                return Err(err);
            }
            let message_id = self.next_id();
            self.sent.lock().push(Sent::Text {
                conversation,
                message_id,
                text: text.to_string(),
                choices: choices.cloned(),
            });
            Ok(MessageRef {
                conversation,
                message_id,
            })
        }

        async fn edit_text(&self, message: MessageRef, text: &str) -> Result<(), TransportError> {
            if let Some(err) = self.failure() {
                return Err(err);
            }
            self.sent.lock().push(Sent::Edit {
                message,
                text: text.to_string(),
            });
            Ok(())
        }

        async fn send_file(
            &self,
            conversation: ConversationId,
            path: &Path,
            caption: &str,
        ) -> Result<MessageRef, TransportError> {
            if let Some(err) = self.failure() {
                return Err(err);
            }
            let message_id = self.next_id();
            self.sent.lock().push(Sent::File {
                conversation,
                path: path.to_path_buf(),
                caption: caption.to_string(),
            });
            Ok(MessageRef {
                conversation,
                message_id,
            })
        }
    }
}
