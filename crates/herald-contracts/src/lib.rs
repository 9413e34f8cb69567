use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Chat id as the transport sees it. The unit of authorization and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptId(pub String);

impl fmt::Display for PromptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message that already exists in a conversation (for edits and reply matching).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub conversation: ConversationId,
    pub message_id: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    PlanApproval,
    ChangeApproval,
    FreeformQuestion,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::PlanApproval => "plan_approval",
            RequestKind::ChangeApproval => "change_approval",
            RequestKind::FreeformQuestion => "freeform_question",
        }
    }

    pub fn is_approval(self) -> bool {
        !matches!(self, RequestKind::FreeformQuestion)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestPayload {
    PlanApproval {
        summary: String,
        #[serde(default)]
        files_affected: Vec<String>,
        #[serde(default)]
        task_name: Option<String>,
    },
    ChangeApproval {
        summary: String,
        #[serde(default)]
        diff_preview: Option<String>,
    },
    FreeformQuestion {
        prompt: String,
    },
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestPayload::PlanApproval { .. } => RequestKind::PlanApproval,
            RequestPayload::ChangeApproval { .. } => RequestKind::ChangeApproval,
            RequestPayload::FreeformQuestion { .. } => RequestKind::FreeformQuestion,
        }
    }
}

/// Final outcome of a pending request. Written exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    Approved,
    Rejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Answered {
        text: String,
    },
    TimedOut,
    Cancelled,
}

impl Resolution {
    pub fn name(&self) -> &'static str {
        match self {
            Resolution::Approved => "approved",
            Resolution::Rejected { .. } => "rejected",
            Resolution::Answered { .. } => "answered",
            Resolution::TimedOut => "timed_out",
            Resolution::Cancelled => "cancelled",
        }
    }
}

/// Button choices offered for an approval request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Choice {
    Approve,
    Reject,
}

impl Choice {
    pub fn as_str(self) -> &'static str {
        match self {
            Choice::Approve => "approve",
            Choice::Reject => "reject",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "approve" => Some(Choice::Approve),
            "reject" => Some(Choice::Reject),
            _ => None,
        }
    }

    pub fn resolution(self) -> Resolution {
        match self {
            Choice::Approve => Resolution::Approved,
            Choice::Reject => Resolution::Rejected { reason: None },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceButton {
    pub label: String,
    pub choice: Choice,
}

/// Buttons attached to an outbound message, correlated to one pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceSet {
    pub request_id: RequestId,
    pub buttons: Vec<ChoiceButton>,
}

impl ChoiceSet {
    pub fn approve_reject(request_id: RequestId, approve: &str, reject: &str) -> Self {
        Self {
            request_id,
            buttons: vec![
                ChoiceButton {
                    label: approve.to_string(),
                    choice: Choice::Approve,
                },
                ChoiceButton {
                    label: reject.to_string(),
                    choice: Choice::Reject,
                },
            ],
        }
    }
}

/// Read-only view of a registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: RequestId,
    pub kind: RequestKind,
    pub payload: RequestPayload,
    pub conversation: ConversationId,
    pub created_at: String,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub message: Option<MessageRef>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedPrompt {
    pub id: PromptId,
    pub text: String,
    pub enqueued_at: String,
    pub conversation: ConversationId,
    #[serde(default)]
    pub consumed: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Info,
    Warning,
    Critical,
}

impl Priority {
    pub fn icon(self) -> &'static str {
        match self {
            Priority::Info => "ℹ️",
            Priority::Warning => "⚠️",
            Priority::Critical => "🚨",
        }
    }
}

/// Inbound chat interaction, already stripped of transport details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Command {
        conversation: ConversationId,
        name: String,
        #[serde(default)]
        args: String,
    },
    ButtonCallback {
        conversation: ConversationId,
        data: String,
        #[serde(default)]
        message: Option<MessageRef>,
    },
    PlainText {
        conversation: ConversationId,
        text: String,
        #[serde(default)]
        reply_to: Option<MessageRef>,
    },
}

impl InboundEvent {
    pub fn conversation(&self) -> ConversationId {
        match self {
            InboundEvent::Command { conversation, .. }
            | InboundEvent::ButtonCallback { conversation, .. }
            | InboundEvent::PlainText { conversation, .. } => *conversation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    SendTelegramMessage,
    RequestPlanApproval,
    RequestChangeApproval,
    AwaitUserResponse,
    NotifyError,
    UpdateStatus,
    SendArtifact,
    SendCompletion,
    SendCodeUpdate,
    WaitForNewPrompt,
    GetPendingPrompts,
}

impl ToolName {
    pub const ALL: [ToolName; 11] = [
        ToolName::SendTelegramMessage,
        ToolName::RequestPlanApproval,
        ToolName::RequestChangeApproval,
        ToolName::AwaitUserResponse,
        ToolName::NotifyError,
        ToolName::UpdateStatus,
        ToolName::SendArtifact,
        ToolName::SendCompletion,
        ToolName::SendCodeUpdate,
        ToolName::WaitForNewPrompt,
        ToolName::GetPendingPrompts,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::SendTelegramMessage => "send_telegram_message",
            ToolName::RequestPlanApproval => "request_plan_approval",
            ToolName::RequestChangeApproval => "request_change_approval",
            ToolName::AwaitUserResponse => "await_user_response",
            ToolName::NotifyError => "notify_error",
            ToolName::UpdateStatus => "update_status",
            ToolName::SendArtifact => "send_artifact",
            ToolName::SendCompletion => "send_completion",
            ToolName::SendCodeUpdate => "send_code_update",
            ToolName::WaitForNewPrompt => "wait_for_new_prompt",
            ToolName::GetPendingPrompts => "get_pending_prompts",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.as_str() == name)
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolName::SendTelegramMessage => {
                "Send a message to the user via Telegram. Use for status updates, informational \
                 messages, or anything that does not need a decision."
            }
            ToolName::RequestPlanApproval => {
                "Request approval for an implementation plan before making changes. Blocks until \
                 the user approves, rejects, or the request times out."
            }
            ToolName::RequestChangeApproval => {
                "Request approval for specific code changes before they are committed. Blocks \
                 until the user decides or the request times out."
            }
            ToolName::AwaitUserResponse => {
                "Ask the user a question and wait for a free-text answer."
            }
            ToolName::NotifyError => {
                "Send a critical error notification, e.g. when a command fails and needs attention."
            }
            ToolName::UpdateStatus => {
                "Update the status ticker. Edits the existing status message instead of sending \
                 a new one."
            }
            ToolName::SendArtifact => {
                "Send an artifact (screenshot, recording or other file) to the user."
            }
            ToolName::SendCompletion => {
                "Report that the current task is finished. Closes the status ticker."
            }
            ToolName::SendCodeUpdate => {
                "Tell the user a file was created, modified or deleted. Use after significant \
                 code changes."
            }
            ToolName::WaitForNewPrompt => {
                "Wait for the next prompt sent from Telegram and return it. Returns early as soon \
                 as a prompt arrives; use in a loop to pick up new tasks."
            }
            ToolName::GetPendingPrompts => {
                "List prompts queued from Telegram, optionally removing them from the queue."
            }
        }
    }

    pub fn input_schema(self) -> Value {
        let (mut properties, required): (Map<String, Value>, Vec<&str>) = match self {
            ToolName::SendTelegramMessage => (
                props(json!({
                    "message": {"type": "string", "description": "The message to send"},
                    "priority": {
                        "type": "string",
                        "enum": ["info", "warning", "critical"],
                        "default": "info"
                    }
                })),
                vec!["message"],
            ),
            ToolName::RequestPlanApproval => (
                props(json!({
                    "plan_summary": {"type": "string", "description": "Summary of the plan"},
                    "files_affected": {"type": "array", "items": {"type": "string"}},
                    "task_name": {"type": "string"},
                    "timeout_seconds": timeout_schema()
                })),
                vec!["plan_summary"],
            ),
            ToolName::RequestChangeApproval => (
                props(json!({
                    "change_summary": {"type": "string"},
                    "diff_preview": {"type": "string"},
                    "timeout_seconds": timeout_schema()
                })),
                vec!["change_summary"],
            ),
            ToolName::AwaitUserResponse => (
                props(json!({
                    "prompt": {"type": "string", "description": "Question shown to the user"},
                    "timeout_seconds": timeout_schema()
                })),
                vec!["prompt"],
            ),
            ToolName::NotifyError => (
                props(json!({
                    "error_message": {"type": "string"},
                    "stack_trace": {"type": "string"},
                    "command": {"type": "string"}
                })),
                vec!["error_message"],
            ),
            ToolName::UpdateStatus => (
                props(json!({
                    "status_text": {"type": "string"},
                    "progress_percent": {"type": "integer", "minimum": 0, "maximum": 100}
                })),
                vec!["status_text"],
            ),
            ToolName::SendArtifact => (
                props(json!({
                    "artifact_path": {"type": "string", "description": "Absolute path to the file"},
                    "caption": {"type": "string"}
                })),
                vec!["artifact_path"],
            ),
            ToolName::SendCompletion => (
                props(json!({
                    "summary": {"type": "string"},
                    "files_changed": {"type": "integer", "minimum": 0},
                    "duration": {"type": "string"}
                })),
                vec!["summary"],
            ),
            ToolName::SendCodeUpdate => (
                props(json!({
                    "file_path": {"type": "string", "description": "Path to the changed file"},
                    "change_type": {
                        "type": "string",
                        "enum": ["created", "modified", "deleted"]
                    },
                    "summary": {"type": "string"},
                    "diff_preview": {"type": "string"}
                })),
                vec!["file_path", "change_type", "summary"],
            ),
            ToolName::WaitForNewPrompt => (
                props(json!({
                    "timeout_seconds": {
                        "type": "integer",
                        "minimum": 0,
                        "description": "Maximum seconds to wait"
                    }
                })),
                vec![],
            ),
            ToolName::GetPendingPrompts => (
                props(json!({
                    "clear_after_read": {"type": "boolean", "default": true}
                })),
                vec![],
            ),
        };
        properties.insert(
            "chat_id".to_string(),
            json!({"type": "integer", "description": "Target chat; defaults to the primary chat"}),
        );

        let mut schema = json!({"type": "object", "properties": Value::Object(properties)});
        if !required.is_empty() {
            schema["required"] = json!(required);
        }
        schema
    }
}

fn props(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn timeout_schema() -> Value {
    json!({
        "type": "integer",
        "minimum": 0,
        "description": "Seconds to wait for the user; 0 waits indefinitely"
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    ToolName::ALL
        .into_iter()
        .map(|tool| ToolDefinition {
            name: tool.as_str().to_string(),
            description: tool.description().to_string(),
            input_schema: tool.input_schema(),
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SendMessageArgs {
    pub message: String,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PlanApprovalArgs {
    pub plan_summary: String,
    #[serde(default)]
    pub files_affected: Vec<String>,
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChangeApprovalArgs {
    pub change_summary: String,
    #[serde(default)]
    pub diff_preview: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AwaitResponseArgs {
    pub prompt: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NotifyErrorArgs {
    pub error_message: String,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UpdateStatusArgs {
    pub status_text: String,
    #[serde(default)]
    pub progress_percent: Option<u8>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SendArtifactArgs {
    pub artifact_path: String,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SendCompletionArgs {
    pub summary: String,
    #[serde(default)]
    pub files_changed: Option<u32>,
    #[serde(default)]
    pub duration: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
}

impl ChangeType {
    pub fn icon(self) -> &'static str {
        match self {
            ChangeType::Created => "✨",
            ChangeType::Modified => "📝",
            ChangeType::Deleted => "🗑️",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Modified => "modified",
            ChangeType::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CodeUpdateArgs {
    pub file_path: String,
    pub change_type: ChangeType,
    pub summary: String,
    #[serde(default)]
    pub diff_preview: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct WaitForPromptArgs {
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GetPendingPromptsArgs {
    #[serde(default = "default_true")]
    pub clear_after_read: bool,
}

fn default_true() -> bool {
    true
}

/// One variant per exposed tool; the transport never dispatches on raw strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    SendTelegramMessage(SendMessageArgs),
    RequestPlanApproval(PlanApprovalArgs),
    RequestChangeApproval(ChangeApprovalArgs),
    AwaitUserResponse(AwaitResponseArgs),
    NotifyError(NotifyErrorArgs),
    UpdateStatus(UpdateStatusArgs),
    SendArtifact(SendArtifactArgs),
    SendCompletion(SendCompletionArgs),
    SendCodeUpdate(CodeUpdateArgs),
    WaitForNewPrompt(WaitForPromptArgs),
    GetPendingPrompts(GetPendingPromptsArgs),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCallError {
    UnknownTool(String),
    InvalidArguments { tool: &'static str, message: String },
}

impl fmt::Display for ToolCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolCallError::UnknownTool(name) => write!(f, "unknown tool: {name}"),
            ToolCallError::InvalidArguments { tool, message } => {
                write!(f, "invalid arguments for {tool}: {message}")
            }
        }
    }
}

impl std::error::Error for ToolCallError {}

/// A parsed `tools/call`: the target conversation (if the caller named one) and the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub conversation: Option<ConversationId>,
    pub call: ToolCall,
}

impl ToolInvocation {
    pub fn parse(name: &str, arguments: Option<Value>) -> Result<Self, ToolCallError> {
        let tool =
            ToolName::parse(name).ok_or_else(|| ToolCallError::UnknownTool(name.to_string()))?;
        let invalid = |message: String| ToolCallError::InvalidArguments {
            tool: tool.as_str(),
            message,
        };

        let mut args = match arguments {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(invalid("arguments must be an object".to_string())),
        };
        let conversation = match args.remove("chat_id") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(ConversationId(
                n.as_i64()
                    .ok_or_else(|| invalid("chat_id must be an integer".to_string()))?,
            )),
            Some(Value::String(s)) => Some(ConversationId(
                s.trim()
                    .parse()
                    .map_err(|_| invalid("chat_id must be an integer".to_string()))?,
            )),
            Some(_) => return Err(invalid("chat_id must be an integer".to_string())),
        };

        let args = Value::Object(args);
        let call = match tool {
            ToolName::SendTelegramMessage => ToolCall::SendTelegramMessage(decode(args, tool)?),
            ToolName::RequestPlanApproval => ToolCall::RequestPlanApproval(decode(args, tool)?),
            ToolName::RequestChangeApproval => {
                ToolCall::RequestChangeApproval(decode(args, tool)?)
            }
            ToolName::AwaitUserResponse => ToolCall::AwaitUserResponse(decode(args, tool)?),
            ToolName::NotifyError => ToolCall::NotifyError(decode(args, tool)?),
            ToolName::UpdateStatus => ToolCall::UpdateStatus(decode(args, tool)?),
            ToolName::SendArtifact => ToolCall::SendArtifact(decode(args, tool)?),
            ToolName::SendCompletion => ToolCall::SendCompletion(decode(args, tool)?),
            ToolName::SendCodeUpdate => ToolCall::SendCodeUpdate(decode(args, tool)?),
            ToolName::WaitForNewPrompt => ToolCall::WaitForNewPrompt(decode(args, tool)?),
            ToolName::GetPendingPrompts => ToolCall::GetPendingPrompts(decode(args, tool)?),
        };
        Ok(Self { conversation, call })
    }
}

fn decode<T: serde::de::DeserializeOwned>(args: Value, tool: ToolName) -> Result<T, ToolCallError> {
    serde_json::from_value(args).map_err(|e| ToolCallError::InvalidArguments {
        tool: tool.as_str(),
        message: e.to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError")]
    pub is_error: bool,
    #[serde(
        rename = "structuredContent",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub structured_content: Option<Value>,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
            structured_content: None,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
            structured_content: None,
        }
    }

    pub fn with_structured(mut self, value: Value) -> Self {
        self.structured_content = Some(value);
        self
    }

    pub fn first_text(&self) -> &str {
        match self.content.first() {
            Some(ToolContent::Text { text }) => text,
            None => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_input_schemas_are_valid_json_schema() {
        for def in tool_definitions() {
            let _validator = jsonschema::validator_for(&def.input_schema)
                .unwrap_or_else(|err| panic!("invalid schema for {}: {err}", def.name));
        }
    }

    #[test]
    fn tool_catalogue_has_unique_names() {
        let defs = tool_definitions();
        let mut names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ToolName::ALL.len());
        for tool in ToolName::ALL {
            assert_eq!(ToolName::parse(tool.as_str()), Some(tool));
        }
    }

    #[test]
    fn invocation_extracts_chat_id_before_decoding() {
        let inv = ToolInvocation::parse(
            "request_plan_approval",
            Some(json!({"plan_summary": "refactor", "chat_id": "42", "timeout_seconds": 5})),
        )
        .unwrap();
        assert_eq!(inv.conversation, Some(ConversationId(42)));
        match inv.call {
            ToolCall::RequestPlanApproval(args) => {
                assert_eq!(args.plan_summary, "refactor");
                assert_eq!(args.timeout_seconds, Some(5));
                assert!(args.files_affected.is_empty());
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn invocation_accepts_missing_arguments_for_optional_tools() {
        let inv = ToolInvocation::parse("wait_for_new_prompt", None).unwrap();
        assert_eq!(
            inv.call,
            ToolCall::WaitForNewPrompt(WaitForPromptArgs {
                timeout_seconds: None
            })
        );

        let inv = ToolInvocation::parse("get_pending_prompts", Some(Value::Null)).unwrap();
        assert_eq!(
            inv.call,
            ToolCall::GetPendingPrompts(GetPendingPromptsArgs {
                clear_after_read: true
            })
        );
    }

    #[test]
    fn code_update_requires_a_known_change_type() {
        let inv = ToolInvocation::parse(
            "send_code_update",
            Some(json!({"file_path": "src/lib.rs", "change_type": "deleted", "summary": "gone"})),
        )
        .unwrap();
        assert!(matches!(
            inv.call,
            ToolCall::SendCodeUpdate(CodeUpdateArgs {
                change_type: ChangeType::Deleted,
                diff_preview: None,
                ..
            })
        ));

        let err = ToolInvocation::parse(
            "send_code_update",
            Some(json!({"file_path": "a", "change_type": "renamed", "summary": "x"})),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ToolCallError::InvalidArguments { tool: "send_code_update", .. }
        ));
    }

    #[test]
    fn invocation_rejects_unknown_tool_and_bad_arguments() {
        assert_eq!(
            ToolInvocation::parse("read_project_file", None),
            Err(ToolCallError::UnknownTool("read_project_file".to_string()))
        );
        let err = ToolInvocation::parse("send_telegram_message", Some(json!({}))).unwrap_err();
        assert!(matches!(
            err,
            ToolCallError::InvalidArguments {
                tool: "send_telegram_message",
                ..
            }
        ));
    }

    #[test]
    fn resolution_serializes_with_outcome_tag() {
        let value = serde_json::to_value(Resolution::Rejected {
            reason: Some("too broad".to_string()),
        })
        .unwrap();
        assert_eq!(value, json!({"outcome": "rejected", "reason": "too broad"}));
        assert_eq!(
            serde_json::to_value(Resolution::TimedOut).unwrap(),
            json!({"outcome": "timed_out"})
        );
    }
}
