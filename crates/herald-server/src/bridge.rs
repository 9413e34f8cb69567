use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use herald_config::Config;
use herald_contracts::{
    ChoiceSet, ConversationId, QueuedPrompt, RequestPayload, ToolCall, ToolInvocation, ToolResult,
};
use herald_kernel as kernel;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Authorization;
use crate::error::BridgeError;
use crate::notifier::Notifier;
use crate::prompts::PromptQueue;
use crate::registry::Registry;

/// Last progress the agent reported through `update_status`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskStatus {
    pub text: String,
    pub progress: Option<u8>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    current: Arc<Mutex<Option<TaskStatus>>>,
}

impl StatusBoard {
    pub fn set(&self, text: &str, progress: Option<u8>) {
        *self.current.lock() = Some(TaskStatus {
            text: text.to_string(),
            progress,
            updated_at: kernel::now_rfc3339(),
        });
    }

    pub fn clear(&self) {
        self.current.lock().take();
    }

    pub fn current(&self) -> Option<TaskStatus> {
        self.current.lock().clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub text: String,
    pub is_error: bool,
    pub structured: Option<Value>,
}

impl ToolOutcome {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
            structured: None,
        }
    }

    fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
            structured: None,
        }
    }

    fn with(mut self, structured: Value) -> Self {
        self.structured = Some(structured);
        self
    }

    pub fn into_tool_result(self) -> ToolResult {
        let result = if self.is_error {
            ToolResult::error(self.text)
        } else {
            ToolResult::text(self.text)
        };
        match self.structured {
            Some(value) => result.with_structured(value),
            None => result,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub primary: ConversationId,
    /// `None` waits indefinitely.
    pub default_timeout: Option<Duration>,
    pub prompt_wait_default: Duration,
}

impl BridgeSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            primary: ConversationId(cfg.primary_chat_id()),
            default_timeout: seconds_or_indefinite(cfg.approvals.default_timeout_secs),
            prompt_wait_default: Duration::from_secs(cfg.prompts.wait_default_secs),
        }
    }
}

fn seconds_or_indefinite(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

struct Inner {
    registry: Registry,
    prompts: PromptQueue,
    notifier: Notifier,
    auth: Authorization,
    status: StatusBoard,
    settings: BridgeSettings,
    shutdown: CancellationToken,
}

/// Entry point for tool calls. Blocking tools suspend until a human decides.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    pub fn new(
        registry: Registry,
        prompts: PromptQueue,
        notifier: Notifier,
        auth: Authorization,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                prompts,
                notifier,
                auth,
                status: StatusBoard::default(),
                settings,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn prompts(&self) -> &PromptQueue {
        &self.inner.prompts
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn status(&self) -> &StatusBoard {
        &self.inner.status
    }

    pub fn primary_conversation(&self) -> ConversationId {
        self.inner.settings.primary
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Runs one tool call. Failures come back as error outcomes, never panics.
    pub async fn call(&self, invocation: ToolInvocation) -> ToolOutcome {
        let conversation = invocation
            .conversation
            .unwrap_or(self.inner.settings.primary);
        match self.dispatch(conversation, invocation.call).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%conversation, error = %err, "tool call failed");
                ToolOutcome::error(format!("Error: {err}"))
            }
        }
    }

    async fn dispatch(
        &self,
        conversation: ConversationId,
        call: ToolCall,
    ) -> Result<ToolOutcome, BridgeError> {
        if !self.inner.auth.allows(conversation) {
            return Err(BridgeError::Unauthorized(conversation));
        }
        let notifier = &self.inner.notifier;

        match call {
            ToolCall::SendTelegramMessage(args) => {
                let text = kernel::info_message(&args.message, args.priority);
                notifier.send(conversation, &text).await?;
                Ok(ToolOutcome::ok("Message sent successfully"))
            }
            ToolCall::RequestPlanApproval(args) => {
                self.request(
                    conversation,
                    RequestPayload::PlanApproval {
                        summary: args.plan_summary,
                        files_affected: args.files_affected,
                        task_name: args.task_name,
                    },
                    args.timeout_seconds,
                )
                .await
            }
            ToolCall::RequestChangeApproval(args) => {
                self.request(
                    conversation,
                    RequestPayload::ChangeApproval {
                        summary: args.change_summary,
                        diff_preview: args.diff_preview,
                    },
                    args.timeout_seconds,
                )
                .await
            }
            ToolCall::AwaitUserResponse(args) => {
                self.request(
                    conversation,
                    RequestPayload::FreeformQuestion {
                        prompt: args.prompt,
                    },
                    args.timeout_seconds,
                )
                .await
            }
            ToolCall::NotifyError(args) => {
                let text = kernel::error_message(
                    &args.error_message,
                    args.stack_trace.as_deref(),
                    args.command.as_deref(),
                );
                notifier.send(conversation, &text).await?;
                Ok(ToolOutcome::ok("Error notification sent"))
            }
            ToolCall::UpdateStatus(args) => {
                if args.progress_percent.is_some_and(|p| p > 100) {
                    return Err(BridgeError::InvalidInput(
                        "progress_percent must be between 0 and 100".to_string(),
                    ));
                }
                let text = kernel::status_message(&args.status_text, args.progress_percent);
                notifier.update_ticker(conversation, &text).await?;
                self.inner
                    .status
                    .set(&args.status_text, args.progress_percent);
                Ok(ToolOutcome::ok("Status updated"))
            }
            ToolCall::SendArtifact(args) => {
                let path = Path::new(&args.artifact_path);
                if !path.is_file() {
                    return Err(BridgeError::InvalidInput(format!(
                        "Artifact not found at {}",
                        args.artifact_path
                    )));
                }
                let caption = kernel::artifact_caption(path, args.caption.as_deref());
                notifier.send_artifact(conversation, path, &caption).await?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| args.artifact_path.clone());
                Ok(ToolOutcome::ok(format!("Artifact sent: {name}")))
            }
            ToolCall::SendCompletion(args) => {
                let text = kernel::completion_message(
                    &args.summary,
                    args.files_changed,
                    args.duration.as_deref(),
                );
                notifier.send(conversation, &text).await?;
                notifier.clear_ticker(conversation).await?;
                self.inner.status.clear();
                Ok(ToolOutcome::ok("Completion notice sent"))
            }
            ToolCall::SendCodeUpdate(args) => {
                let text = kernel::code_update_message(
                    &args.file_path,
                    args.change_type,
                    &args.summary,
                    args.diff_preview.as_deref(),
                );
                notifier.send(conversation, &text).await?;
                Ok(ToolOutcome::ok(format!(
                    "Code update notification sent for {}",
                    args.file_path
                )))
            }
            ToolCall::WaitForNewPrompt(args) => {
                let timeout = match args.timeout_seconds {
                    Some(secs) => seconds_or_indefinite(secs),
                    None => Some(self.inner.settings.prompt_wait_default),
                };
                match self.inner.prompts.wait_for_next(timeout).await? {
                    Some(prompt) => {
                        info!(prompt_id = %prompt.id, "prompt handed to agent");
                        Ok(ToolOutcome::ok(format!("New prompt from Telegram: {}", prompt.text))
                            .with(json!({ "prompt": prompt })))
                    }
                    None => Ok(ToolOutcome::ok("No new prompts received within timeout.")
                        .with(json!({ "prompt": Value::Null }))),
                }
            }
            ToolCall::GetPendingPrompts(args) => {
                let prompts: Vec<QueuedPrompt> = if args.clear_after_read {
                    self.inner.prompts.drain_all()?
                } else {
                    self.inner.prompts.snapshot()?
                };
                Ok(ToolOutcome::ok(kernel::prompt_list_text(&prompts))
                    .with(json!({ "prompts": prompts })))
            }
        }
    }

    /// Create, announce, then wait. Delivery failure cancels the request.
    async fn request(
        &self,
        conversation: ConversationId,
        payload: RequestPayload,
        timeout_seconds: Option<u64>,
    ) -> Result<ToolOutcome, BridgeError> {
        let kind = payload.kind();
        let timeout = match timeout_seconds {
            Some(secs) => seconds_or_indefinite(secs),
            None => self.inner.settings.default_timeout,
        };
        let text = match &payload {
            RequestPayload::PlanApproval {
                summary,
                files_affected,
                task_name,
            } => kernel::plan_message(summary, files_affected, task_name.as_deref()),
            RequestPayload::ChangeApproval {
                summary,
                diff_preview,
            } => kernel::change_message(summary, diff_preview.as_deref()),
            RequestPayload::FreeformQuestion { prompt } => kernel::question_message(prompt),
        };

        let registry = &self.inner.registry;
        let id = registry.create(payload, conversation, timeout)?;
        let _guard = registry.guard(id.clone());
        let choices = if kind.is_approval() {
            let (approve, reject) = kernel::button_labels(kind);
            ChoiceSet::approve_reject(id.clone(), approve, reject)
        } else {
            ChoiceSet {
                request_id: id.clone(),
                buttons: Vec::new(),
            }
        };

        // On delivery failure the guard cancels and removes the request.
        let message = self
            .inner
            .notifier
            .send_with_choices(conversation, &text, choices)
            .await?;

        let resolution = registry.await_resolution(&id).await?;
        info!(
            request_id = %id,
            kind = kind.as_str(),
            outcome = resolution.name(),
            "request resolved"
        );
        if let Err(err) = self
            .inner
            .notifier
            .edit(message, &kernel::with_decision(&text, &resolution))
            .await
        {
            debug!(request_id = %id, error = %err, "could not mark request message");
        }

        Ok(ToolOutcome::ok(kernel::outcome_text(kind, &resolution)).with(json!({
            "request_id": id,
            "kind": kind,
            "resolution": resolution,
        })))
    }

    /// Shutdown order: refuse new work, cancel waiters, drain outbound.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.prompts.close();
        let cancelled = self.inner.registry.close();
        info!(cancelled, "bridge closing");
        // Let woken waiters queue their final edits before the workers stop.
        tokio::task::yield_now().await;
        self.inner.notifier.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::notifier::testing::{RecordingTransport, Sent};
    use crate::notifier::RetryPolicy;
    use herald_contracts::Resolution;

    struct Harness {
        bridge: Bridge,
        transport: Arc<RecordingTransport>,
    }

    fn harness() -> Harness {
        let auth = Authorization::new([1, 2]);
        let registry = Registry::new(auth.clone());
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Notifier::new(
            transport.clone(),
            RetryPolicy {
                max_attempts: 1,
                backoff: Duration::ZERO,
                backoff_max: Duration::ZERO,
            },
            registry.clone(),
        );
        let bridge = Bridge::new(
            registry,
            PromptQueue::memory(auth.clone()),
            notifier,
            auth,
            BridgeSettings {
                primary: ConversationId(1),
                default_timeout: Some(Duration::from_secs(300)),
                prompt_wait_default: Duration::from_secs(60),
            },
        );
        Harness { bridge, transport }
    }

    fn invoke(name: &str, args: Value) -> ToolInvocation {
        ToolInvocation::parse(name, Some(args)).expect("valid invocation")
    }

    async fn wait_for_pending(bridge: &Bridge) -> herald_contracts::PendingRequest {
        for _ in 0..100 {
            if let Some(req) = bridge.registry().pending().into_iter().next() {
                if req.message.is_some() {
                    return req;
                }
            }
            tokio::task::yield_now().await;
        }
        panic!("no pending request appeared");
    }

    #[tokio::test]
    async fn plan_approval_blocks_until_resolved() {
        let h = harness();
        let call = {
            let bridge = h.bridge.clone();
            tokio::spawn(async move {
                bridge
                    .call(invoke(
                        "request_plan_approval",
                        json!({"plan_summary": "Refactor auth", "files_affected": ["src/auth.rs"]}),
                    ))
                    .await
            })
        };
        let pending = wait_for_pending(&h.bridge).await;
        assert_eq!(pending.conversation, ConversationId(1));
        assert!(h.bridge.registry().resolve(&pending.id, Resolution::Approved));

        let outcome = call.await.expect("join");
        assert!(!outcome.is_error);
        assert_eq!(
            outcome.text,
            "Plan approved by user. Proceeding with implementation."
        );
        let sent = h.transport.sent();
        assert!(matches!(
            &sent[0],
            Sent::Text { choices: Some(c), .. } if c.buttons.len() == 2 && c.request_id == pending.id
        ));
        assert!(matches!(
            sent.last(),
            Some(Sent::Edit { text, .. }) if text.ends_with("Status: ✅ Approved")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn approval_times_out_as_distinct_outcome() {
        let h = harness();
        let outcome = h
            .bridge
            .call(invoke(
                "request_change_approval",
                json!({"change_summary": "rename", "timeout_seconds": 2}),
            ))
            .await;
        assert!(!outcome.is_error);
        assert!(outcome.text.contains("Treat the changes as rejected"));
        assert_eq!(
            outcome.structured.as_ref().map(|v| v["resolution"].clone()),
            Some(json!({"outcome": "timed_out"}))
        );
    }

    #[tokio::test]
    async fn delivery_failure_cancels_request_and_reports_error() {
        let h = harness();
        h.transport
            .fail_next(TransportError::Retryable("connection reset".to_string()));
        let outcome = h
            .bridge
            .call(invoke("await_user_response", json!({"prompt": "color?"})))
            .await;
        assert!(outcome.is_error);
        assert!(h.bridge.registry().pending().is_empty());
    }

    #[tokio::test]
    async fn dropped_call_leaves_no_request_behind() {
        let h = harness();
        {
            let call = h
                .bridge
                .call(invoke("request_plan_approval", json!({"plan_summary": "p"})));
            tokio::pin!(call);
            tokio::select! {
                biased;
                _ = &mut call => panic!("call finished before anyone decided"),
                _ = std::future::ready(()) => {}
            }
            assert_eq!(h.bridge.registry().pending().len(), 1);
        }
        assert!(h.bridge.registry().pending().is_empty());
    }

    #[tokio::test]
    async fn huge_timeouts_wait_without_deadline() {
        let h = harness();
        let call = {
            let bridge = h.bridge.clone();
            tokio::spawn(async move {
                bridge
                    .call(invoke(
                        "request_plan_approval",
                        json!({"plan_summary": "p", "timeout_seconds": u64::MAX}),
                    ))
                    .await
            })
        };
        let pending = wait_for_pending(&h.bridge).await;
        assert!(pending.deadline.is_none());
        assert!(h.bridge.registry().resolve(&pending.id, Resolution::Approved));
        let outcome = call.await.expect("join");
        assert!(!outcome.is_error);

        let wait = {
            let bridge = h.bridge.clone();
            tokio::spawn(async move {
                bridge
                    .call(invoke(
                        "wait_for_new_prompt",
                        json!({"timeout_seconds": u64::MAX}),
                    ))
                    .await
            })
        };
        tokio::task::yield_now().await;
        h.bridge
            .prompts()
            .enqueue(ConversationId(1), "next task")
            .expect("enqueue");
        let outcome = wait.await.expect("join");
        assert_eq!(outcome.text, "New prompt from Telegram: next task");
    }

    #[tokio::test]
    async fn unauthorized_target_is_refused() {
        let h = harness();
        let outcome = h
            .bridge
            .call(invoke(
                "send_telegram_message",
                json!({"message": "hi", "chat_id": 999}),
            ))
            .await;
        assert!(outcome.is_error);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_blocked_calls() {
        let h = harness();
        let calls: Vec<_> = [
            ("request_plan_approval", json!({"plan_summary": "p"})),
            ("await_user_response", json!({"prompt": "which db?"})),
        ]
        .into_iter()
        .map(|(name, args)| {
            let bridge = h.bridge.clone();
            tokio::spawn(async move { bridge.call(invoke(name, args)).await })
        })
        .collect();
        for _ in 0..100 {
            let pending = h.bridge.registry().pending();
            if pending.len() == 2 && pending.iter().all(|r| r.message.is_some()) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.bridge.registry().pending().len(), 2);
        h.bridge.shutdown().await;

        for call in calls {
            let outcome = call.await.expect("join");
            assert!(!outcome.is_error);
            assert_eq!(
                outcome.structured.as_ref().map(|v| v["resolution"].clone()),
                Some(json!({"outcome": "cancelled"}))
            );
        }
        assert!(h.bridge.registry().pending().is_empty());
        let again = h
            .bridge
            .call(invoke("request_plan_approval", json!({"plan_summary": "p"})))
            .await;
        assert!(again.is_error);
    }

    #[tokio::test]
    async fn status_and_completion_manage_ticker() {
        let h = harness();
        for (text, pct) in [("build", 10), ("test", 60)] {
            let outcome = h
                .bridge
                .call(invoke(
                    "update_status",
                    json!({"status_text": text, "progress_percent": pct}),
                ))
                .await;
            assert_eq!(outcome.text, "Status updated");
        }
        assert_eq!(
            h.bridge.status().current().map(|s| s.progress),
            Some(Some(60))
        );

        let bad = h
            .bridge
            .call(invoke(
                "update_status",
                json!({"status_text": "x", "progress_percent": 150}),
            ))
            .await;
        assert!(bad.is_error);

        h.bridge
            .call(invoke("send_completion", json!({"summary": "done", "files_changed": 2})))
            .await;
        assert!(h.bridge.status().current().is_none());

        let sent = h.transport.sent();
        let edits = sent.iter().filter(|s| matches!(s, Sent::Edit { .. })).count();
        assert_eq!(edits, 1);
    }

    #[tokio::test]
    async fn prompt_tools_read_the_queue() {
        let h = harness();
        h.bridge
            .prompts()
            .enqueue(ConversationId(2), "fix login")
            .expect("enqueue");
        h.bridge
            .prompts()
            .enqueue(ConversationId(1), "add tests")
            .expect("enqueue");

        let peek = h
            .bridge
            .call(invoke("get_pending_prompts", json!({"clear_after_read": false})))
            .await;
        assert!(peek.text.starts_with("Found 2 pending prompt(s)"));

        let next = h
            .bridge
            .call(invoke("wait_for_new_prompt", json!({"timeout_seconds": 1})))
            .await;
        assert_eq!(next.text, "New prompt from Telegram: fix login");

        let rest = h
            .bridge
            .call(invoke("get_pending_prompts", json!({})))
            .await;
        assert!(rest.text.contains("1. add tests"));
        assert!(h.bridge.prompts().is_empty());
    }

    #[tokio::test]
    async fn code_update_is_announced() {
        let h = harness();
        let outcome = h
            .bridge
            .call(invoke(
                "send_code_update",
                json!({"file_path": "src/auth.rs", "change_type": "modified", "summary": "token refresh"}),
            ))
            .await;
        assert_eq!(outcome.text, "Code update notification sent for src/auth.rs");
        assert!(matches!(
            h.transport.sent().first(),
            Some(Sent::Text { text, choices: None, .. }) if text.starts_with("📝 MODIFIED: src/auth.rs")
        ));
    }

    #[tokio::test]
    async fn missing_artifact_is_an_error_result() {
        let h = harness();
        let outcome = h
            .bridge
            .call(invoke(
                "send_artifact",
                json!({"artifact_path": "/nonexistent/shot.png"}),
            ))
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text.contains("Artifact not found"));
    }
}
