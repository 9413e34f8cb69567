use herald_config::ReplyPolicy;
use herald_contracts::{ConversationId, InboundEvent, MessageRef, PromptId, RequestId, Resolution};
use herald_kernel as kernel;
use tracing::{debug, info, warn};

use crate::auth::Authorization;
use crate::bridge::Bridge;
use crate::error::BridgeError;

const CANCEL_REASON: &str = "Cancelled by the user with /cancel";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Resolved {
        request: RequestId,
        resolution: Resolution,
    },
    /// Aimed at a request that is unknown, expired or already decided.
    Stale { request: Option<RequestId> },
    PromptQueued(PromptId),
    /// Informational command answered, or usage hint sent.
    Replied,
    Unauthorized,
    Ignored,
}

impl RouteOutcome {
    /// Short text for acknowledging a button press.
    pub fn callback_label(&self) -> &'static str {
        match self {
            RouteOutcome::Resolved {
                resolution: Resolution::Approved,
                ..
            } => "✅ Approved",
            RouteOutcome::Resolved {
                resolution: Resolution::Rejected { .. },
                ..
            } => "❌ Rejected",
            RouteOutcome::Resolved { .. } => "Recorded",
            RouteOutcome::Stale { .. } => "This request is no longer pending",
            _ => "",
        }
    }
}

/// Maps inbound chat interactions onto pending requests or the prompt queue.
#[derive(Clone)]
pub struct ResponseRouter {
    bridge: Bridge,
    auth: Authorization,
    policy: ReplyPolicy,
}

impl ResponseRouter {
    pub fn new(bridge: Bridge, auth: Authorization, policy: ReplyPolicy) -> Self {
        Self {
            bridge,
            auth,
            policy,
        }
    }

    pub async fn route(&self, event: InboundEvent) -> RouteOutcome {
        let conversation = event.conversation();
        if !self.auth.allows(conversation) {
            warn!(%conversation, "dropping event from unauthorized conversation");
            return RouteOutcome::Unauthorized;
        }

        match event {
            InboundEvent::ButtonCallback { data, .. } => match kernel::parse_callback(&data) {
                Some((id, choice)) => self.resolve(id, choice.resolution()),
                None => {
                    debug!(%conversation, %data, "ignoring unknown callback payload");
                    RouteOutcome::Ignored
                }
            },
            InboundEvent::Command { name, args, .. } => {
                self.command(conversation, &name, &args).await
            }
            InboundEvent::PlainText { text, reply_to, .. } => {
                self.plain_text(conversation, &text, reply_to).await
            }
        }
    }

    async fn command(&self, conversation: ConversationId, name: &str, args: &str) -> RouteOutcome {
        match name {
            "start" | "help" => {
                self.reply(conversation, &kernel::help_text()).await;
                RouteOutcome::Replied
            }
            "status" => {
                let status = self.bridge.status().current();
                let report = kernel::status_report(
                    status
                        .as_ref()
                        .map(|s| (s.text.as_str(), s.progress, s.updated_at.as_str())),
                    self.bridge.registry().pending().len(),
                    self.bridge.prompts().len(),
                );
                self.reply(conversation, &report).await;
                RouteOutcome::Replied
            }
            "prompt" => {
                if args.trim().is_empty() {
                    self.reply(conversation, "❌ Please provide a prompt.\nUsage: /prompt Fix the login bug")
                        .await;
                    return RouteOutcome::Replied;
                }
                self.enqueue(conversation, args).await
            }
            "approve" => self.resolve_latest(conversation, Resolution::Approved).await,
            "reject" => {
                let reason = args.trim();
                let resolution = Resolution::Rejected {
                    reason: (!reason.is_empty()).then(|| reason.to_string()),
                };
                self.resolve_latest(conversation, resolution).await
            }
            "cancel" => {
                if let Err(err) = self.bridge.notifier().clear_ticker(conversation).await {
                    debug!(%conversation, error = %err, "could not clear ticker");
                }
                self.bridge.status().clear();
                let outcome = match self.bridge.registry().latest_pending_for(conversation) {
                    Some(request) => self.resolve(
                        request.id,
                        Resolution::Rejected {
                            reason: Some(CANCEL_REASON.to_string()),
                        },
                    ),
                    None => RouteOutcome::Replied,
                };
                self.reply(conversation, "🛑 Task cancelled and cleared.").await;
                outcome
            }
            other => {
                debug!(%conversation, command = other, "unknown command");
                self.reply(conversation, "Unknown command. Send /help for the list.")
                    .await;
                RouteOutcome::Replied
            }
        }
    }

    async fn plain_text(
        &self,
        conversation: ConversationId,
        text: &str,
        reply_to: Option<MessageRef>,
    ) -> RouteOutcome {
        if let Some(message) = reply_to {
            if let Some(id) = self.bridge.registry().find_by_message(message) {
                return match self.bridge.registry().get(&id) {
                    Some(request) => {
                        self.resolve(id, kernel::resolution_for_text(request.kind, text))
                    }
                    None => {
                        self.reply(conversation, "⌛ That request is no longer pending.")
                            .await;
                        RouteOutcome::Stale { request: Some(id) }
                    }
                };
            }
        }

        if self.policy == ReplyPolicy::LatestRequest {
            if let Some(request) = self.bridge.registry().latest_pending_for(conversation) {
                return self.resolve(
                    request.id,
                    kernel::resolution_for_text(request.kind, text),
                );
            }
        }
        self.enqueue(conversation, text).await
    }

    async fn resolve_latest(&self, conversation: ConversationId, resolution: Resolution) -> RouteOutcome {
        match self.bridge.registry().latest_pending_for(conversation) {
            Some(request) => self.resolve(request.id, resolution),
            None => {
                self.reply(conversation, "Nothing is waiting for a decision.")
                    .await;
                RouteOutcome::Replied
            }
        }
    }

    fn resolve(&self, id: RequestId, resolution: Resolution) -> RouteOutcome {
        if self.bridge.registry().resolve(&id, resolution.clone()) {
            info!(request_id = %id, outcome = resolution.name(), "request resolved from chat");
            RouteOutcome::Resolved {
                request: id,
                resolution,
            }
        } else {
            debug!(request_id = %id, "stale resolution ignored");
            RouteOutcome::Stale { request: Some(id) }
        }
    }

    async fn enqueue(&self, conversation: ConversationId, text: &str) -> RouteOutcome {
        match self.bridge.prompts().enqueue(conversation, text) {
            Ok(id) => {
                info!(prompt_id = %id, %conversation, "prompt queued");
                self.reply(conversation, &kernel::prompt_ack(text.trim())).await;
                RouteOutcome::PromptQueued(id)
            }
            Err(BridgeError::InvalidInput(_)) => RouteOutcome::Ignored,
            Err(err) => {
                warn!(%conversation, error = %err, "prompt not queued");
                self.reply(conversation, "⚠️ The bridge is not accepting prompts right now.")
                    .await;
                RouteOutcome::Replied
            }
        }
    }

    async fn reply(&self, conversation: ConversationId, text: &str) {
        if let Err(err) = self.bridge.notifier().send(conversation, text).await {
            warn!(%conversation, error = %err, "reply not delivered");
        }
    }
}
