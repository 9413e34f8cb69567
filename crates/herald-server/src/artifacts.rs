use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use herald_config::Artifacts;
use herald_contracts::ConversationId;
use herald_kernel as kernel;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::notifier::Notifier;

#[derive(Debug, Clone)]
pub struct ExtensionFilter {
    allowed: HashSet<String>,
}

impl ExtensionFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.allowed.contains(&e.to_ascii_lowercase()))
    }
}

/// Forwards new media files from a directory to the primary conversation.
pub struct ArtifactWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ArtifactWatcher {
    /// Returns `None` when forwarding is disabled or the directory is missing.
    pub fn start(
        cfg: &Artifacts,
        dir: PathBuf,
        notifier: Notifier,
        conversation: ConversationId,
        shutdown: CancellationToken,
    ) -> Result<Option<Self>, BridgeError> {
        if !cfg.enabled {
            return Ok(None);
        }
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "artifact directory missing, forwarding disabled");
            return Ok(None);
        }

        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => warn!("artifact watcher error: {e}"),
            }
        })
        .map_err(|e| BridgeError::Startup(format!("failed to create artifact watcher: {e}")))?;
        watcher
            .watch(&dir, RecursiveMode::Recursive)
            .map_err(|e| BridgeError::Startup(format!("failed to watch {}: {e}", dir.display())))?;
        info!(dir = %dir.display(), "watching artifact directory");

        let task = tokio::spawn(forward_artifacts(
            rx,
            ExtensionFilter::new(&cfg.extensions),
            Duration::from_millis(cfg.settle_ms),
            notifier,
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
            debug!(error = %err, "artifact task ended abnormally");
        }
    }
}

/// Batches path events, waits for writes to settle, then sends each new file once.
pub(crate) async fn forward_artifacts(
    mut events: mpsc::UnboundedReceiver<PathBuf>,
    filter: ExtensionFilter,
    settle: Duration,
    notifier: Notifier,
    conversation: ConversationId,
    shutdown: CancellationToken,
) {
    let mut sent_digests = HashSet::new();
    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = events.recv() => match next {
                Some(path) => path,
                None => break,
            },
        };
        if !filter.matches(&first) {
            continue;
        }
        let mut batch = BTreeSet::from([first]);

        tokio::time::sleep(settle).await;
        while let Ok(path) = events.try_recv() {
            if filter.matches(&path) {
                batch.insert(path);
            }
        }

        for path in batch {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) if !bytes.is_empty() => bytes,
                Ok(_) => {
                    debug!(path = %path.display(), "skipping empty artifact");
                    continue;
                }
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "artifact unreadable");
                    continue;
                }
            };
            if !sent_digests.insert(kernel::content_digest(&bytes)) {
                continue;
            }
            let caption = kernel::artifact_caption(&path, None);
            match notifier.send_artifact(conversation, &path, &caption).await {
                Ok(_) => info!(path = %path.display(), "artifact forwarded"),
                Err(err) => warn!(path = %path.display(), error = %err, "artifact not delivered"),
            }
        }
    }
}
