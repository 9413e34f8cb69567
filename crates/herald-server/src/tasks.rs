use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use herald_config::Tasks;
use herald_contracts::ConversationId;
use herald_kernel as kernel;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::prompts::PromptQueue;

/// Queues the contents of a task file as a prompt each time it is saved.
pub struct TaskFileWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl TaskFileWatcher {
    /// Creates the file when missing. Returns `None` when disabled.
    pub fn start(
        cfg: &Tasks,
        file: PathBuf,
        prompts: PromptQueue,
        conversation: ConversationId,
        shutdown: CancellationToken,
    ) -> Result<Option<Self>, BridgeError> {
        if !cfg.enabled {
            return Ok(None);
        }
        let (Some(dir), Some(name)) = (file.parent(), file.file_name()) else {
            return Err(BridgeError::Startup(format!(
                "tasks.file {} does not name a file",
                file.display()
            )));
        };
        let dir = if dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            dir.to_path_buf()
        };
        let name: OsString = name.to_os_string();

        std::fs::create_dir_all(&dir)
            .map_err(|e| BridgeError::Startup(format!("failed to create {}: {e}", dir.display())))?;
        if !file.exists() {
            std::fs::write(&file, b"")
                .map_err(|e| BridgeError::Startup(format!("failed to create {}: {e}", file.display())))?;
            info!(file = %file.display(), "created task file");
        }

        let (tx, rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let touched = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                        && event.paths.iter().any(|p| p.file_name() == Some(name.as_os_str()));
                    if touched {
                        let _ = tx.send(());
                    }
                }
                Err(e) => warn!("task file watcher error: {e}"),
            }
        })
        .map_err(|e| BridgeError::Startup(format!("failed to create task file watcher: {e}")))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| BridgeError::Startup(format!("failed to watch {}: {e}", dir.display())))?;
        info!(file = %file.display(), "watching task file");

        let task = tokio::spawn(queue_task_updates(
            rx,
            file,
            Duration::from_millis(cfg.debounce_ms),
            prompts,
            conversation,
            shutdown,
        ));
        Ok(Some(Self {
            _watcher: watcher,
            task,
        }))
    }

    pub async fn stop(self) {
        drop(self._watcher);
        if let Err(err) = self.task.await {
            debug!(error = %err, "task file loop ended abnormally");
        }
    }
}

/// Each burst of change events yields at most one prompt, and only when the
/// saved contents differ from the last queued version.
pub(crate) async fn queue_task_updates(
    mut changes: mpsc::UnboundedReceiver<()>,
    file: PathBuf,
    debounce: Duration,
    prompts: PromptQueue,
    conversation: ConversationId,
    shutdown: CancellationToken,
) {
    let mut last_digest: Option<String> = None;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = changes.recv() => if next.is_none() { break },
        }
        tokio::time::sleep(debounce).await;
        while changes.try_recv().is_ok() {}

        let content = match tokio::fs::read_to_string(&file).await {
            Ok(content) => content,
            Err(err) => {
                debug!(file = %file.display(), error = %err, "task file unreadable");
                continue;
            }
        };
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        let digest = kernel::content_digest(content.as_bytes());
        if last_digest.as_deref() == Some(digest.as_str()) {
            debug!(file = %file.display(), "task file unchanged");
            continue;
        }

        match prompts.enqueue(conversation, &kernel::task_file_prompt(content)) {
            Ok(id) => {
                info!(prompt_id = %id, chars = content.chars().count(), "task queued from file");
                last_digest = Some(digest);
            }
            Err(BridgeError::ShuttingDown) => break,
            Err(err) => warn!(file = %file.display(), error = %err, "task file not queued"),
        }
    }
}
