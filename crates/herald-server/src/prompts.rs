use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use herald_contracts::{ConversationId, PromptId, QueuedPrompt};
use herald_kernel::now_rfc3339;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::Authorization;
use crate::error::BridgeError;

enum PromptBackend {
    Memory(VecDeque<QueuedPrompt>),
    Sqlite(SqlitePrompts),
}

struct SqlitePrompts {
    conn: Connection,
}

impl SqlitePrompts {
    fn open(path: &Path) -> Result<Self, BridgeError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS prompts (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                prompt_id TEXT NOT NULL UNIQUE,
                text TEXT NOT NULL,
                conversation INTEGER NOT NULL,
                enqueued_at TEXT NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS prompts_unconsumed ON prompts(consumed, seq);
            ",
        )?;
        Ok(Self { conn })
    }

    fn insert(&self, prompt: &QueuedPrompt) -> Result<(), BridgeError> {
        self.conn.execute(
            "INSERT INTO prompts(prompt_id, text, conversation, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
            params![prompt.id.0, prompt.text, prompt.conversation.0, prompt.enqueued_at],
        )?;
        Ok(())
    }

    fn take_first(&self) -> Result<Option<QueuedPrompt>, BridgeError> {
        let row = self
            .conn
            .query_row(
                "SELECT seq, prompt_id, text, conversation, enqueued_at FROM prompts
                 WHERE consumed = 0 ORDER BY seq LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        QueuedPrompt {
                            id: PromptId(row.get(1)?),
                            text: row.get(2)?,
                            conversation: ConversationId(row.get(3)?),
                            enqueued_at: row.get(4)?,
                            consumed: true,
                        },
                    ))
                },
            )
            .optional()?;
        let Some((seq, prompt)) = row else {
            return Ok(None);
        };
        self.conn
            .execute("UPDATE prompts SET consumed = 1 WHERE seq = ?1", params![seq])?;
        Ok(Some(prompt))
    }

    fn unconsumed(&self) -> Result<Vec<QueuedPrompt>, BridgeError> {
        let mut stmt = self.conn.prepare(
            "SELECT prompt_id, text, conversation, enqueued_at FROM prompts
             WHERE consumed = 0 ORDER BY seq",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(QueuedPrompt {
                id: PromptId(row.get(0)?),
                text: row.get(1)?,
                conversation: ConversationId(row.get(2)?),
                enqueued_at: row.get(3)?,
                consumed: false,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn take_all(&self) -> Result<Vec<QueuedPrompt>, BridgeError> {
        let mut prompts = self.unconsumed()?;
        self.conn
            .execute("UPDATE prompts SET consumed = 1 WHERE consumed = 0", [])?;
        for prompt in &mut prompts {
            prompt.consumed = true;
        }
        Ok(prompts)
    }

    fn count(&self) -> Result<usize, BridgeError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM prompts WHERE consumed = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

struct QueueInner {
    backend: PromptBackend,
    closed: bool,
}

/// FIFO of prompts sent from chat; each prompt reaches at most one consumer.
#[derive(Clone)]
pub struct PromptQueue {
    inner: Arc<Mutex<QueueInner>>,
    arrivals: Arc<Notify>,
    auth: Authorization,
}

impl PromptQueue {
    pub fn memory(auth: Authorization) -> Self {
        Self::with_backend(PromptBackend::Memory(VecDeque::new()), auth)
    }

    /// Prompts survive restarts; consumed rows are never handed out again.
    pub fn sqlite(path: &Path, auth: Authorization) -> Result<Self, BridgeError> {
        let store = SqlitePrompts::open(path)?;
        let backlog = store.count()?;
        info!(path = %path.display(), backlog, "opened sqlite prompt store");
        Ok(Self::with_backend(PromptBackend::Sqlite(store), auth))
    }

    fn with_backend(backend: PromptBackend, auth: Authorization) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                backend,
                closed: false,
            })),
            arrivals: Arc::new(Notify::new()),
            auth,
        }
    }

    pub fn enqueue(&self, conversation: ConversationId, text: &str) -> Result<PromptId, BridgeError> {
        if !self.auth.allows(conversation) {
            return Err(BridgeError::Unauthorized(conversation));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(BridgeError::InvalidInput("prompt text is empty".to_string()));
        }

        let prompt = QueuedPrompt {
            id: PromptId(Uuid::new_v4().to_string()),
            text: text.to_string(),
            enqueued_at: now_rfc3339(),
            conversation,
            consumed: false,
        };
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(BridgeError::ShuttingDown);
            }
            match &mut inner.backend {
                PromptBackend::Memory(queue) => queue.push_back(prompt.clone()),
                PromptBackend::Sqlite(store) => store.insert(&prompt)?,
            }
        }
        self.arrivals.notify_waiters();
        debug!(prompt_id = %prompt.id, %conversation, "prompt enqueued");
        Ok(prompt.id)
    }

    /// Oldest unconsumed prompt, without waiting.
    pub fn drain_one(&self) -> Result<Option<QueuedPrompt>, BridgeError> {
        let mut inner = self.inner.lock();
        match &mut inner.backend {
            PromptBackend::Memory(queue) => Ok(queue.pop_front().map(|mut p| {
                p.consumed = true;
                p
            })),
            PromptBackend::Sqlite(store) => store.take_first(),
        }
    }

    pub fn drain_all(&self) -> Result<Vec<QueuedPrompt>, BridgeError> {
        let mut inner = self.inner.lock();
        match &mut inner.backend {
            PromptBackend::Memory(queue) => Ok(queue
                .drain(..)
                .map(|mut p| {
                    p.consumed = true;
                    p
                })
                .collect()),
            PromptBackend::Sqlite(store) => store.take_all(),
        }
    }

    pub fn snapshot(&self) -> Result<Vec<QueuedPrompt>, BridgeError> {
        let inner = self.inner.lock();
        match &inner.backend {
            PromptBackend::Memory(queue) => Ok(queue.iter().cloned().collect()),
            PromptBackend::Sqlite(store) => store.unconsumed(),
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        match &inner.backend {
            PromptBackend::Memory(queue) => queue.len(),
            PromptBackend::Sqlite(store) => store.count().unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for the next prompt. `None` timeout waits until one arrives or the
    /// queue closes; returns `None` on timeout or close. A timeout too large to
    /// represent as an instant also waits without a deadline.
    pub async fn wait_for_next(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<QueuedPrompt>, BridgeError> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(prompt) = self.drain_one()? {
                return Ok(Some(prompt));
            }
            if self.inner.lock().closed {
                return Ok(None);
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Refuses new prompts and wakes every waiter.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.arrivals.notify_waiters();
    }
}
