use chrono::{DateTime, Utc};
use herald_contracts::{ChangeType, Choice, Priority, QueuedPrompt, RequestId, RequestKind, Resolution};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Telegram rejects messages above 4096 characters; leave room for status suffixes.
pub const MAX_MESSAGE_CHARS: usize = 4000;
/// Telegram limit for inline button payloads.
pub const CALLBACK_DATA_MAX_BYTES: usize = 64;

const CALLBACK_PREFIX: &str = "req:";
const MAX_LISTED_FILES: usize = 10;
const DIFF_PREVIEW_CHARS: usize = 1000;
const STACK_TRACE_CHARS: usize = 2000;
const PROGRESS_CELLS: usize = 10;

const APPROVE_WORDS: &[&str] = &[
    "approve", "approved", "accept", "yes", "y", "ok", "okay", "lgtm", "go", "👍", "✅",
];
const REJECT_WORDS: &[&str] = &[
    "reject", "rejected", "no", "n", "deny", "stop", "cancel", "👎", "❌",
];

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Button payload for one choice on one request: `req:<id>:<choice>`.
pub fn encode_callback(id: &RequestId, choice: Choice) -> String {
    format!("{CALLBACK_PREFIX}{id}:{}", choice.as_str())
}

pub fn parse_callback(data: &str) -> Option<(RequestId, Choice)> {
    let rest = data.strip_prefix(CALLBACK_PREFIX)?;
    let (id, choice) = rest.rsplit_once(':')?;
    if id.is_empty() {
        return None;
    }
    Some((RequestId(id.to_string()), Choice::parse(choice)?))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: String,
}

/// Splits `/name@bot args` into a lowercase name and trimmed args.
pub fn parse_command(text: &str) -> Option<ParsedCommand> {
    let rest = text.trim_start().strip_prefix('/')?;
    let (head, args) = match rest.find(char::is_whitespace) {
        Some(idx) => (&rest[..idx], rest[idx..].trim()),
        None => (rest, ""),
    };
    let name = head.split('@').next().unwrap_or_default();
    if name.is_empty() {
        return None;
    }
    Some(ParsedCommand {
        name: name.to_ascii_lowercase(),
        args: args.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    Reject { reason: Option<String> },
    Unrecognized,
}

pub fn parse_verdict(text: &str) -> Verdict {
    let trimmed = text.trim();
    let (first, rest) = match trimmed.find(char::is_whitespace) {
        Some(idx) => (&trimmed[..idx], trimmed[idx..].trim()),
        None => (trimmed, ""),
    };
    let word = first
        .trim_end_matches(['.', '!', ',', ':', ';'])
        .to_lowercase();

    if APPROVE_WORDS.contains(&word.as_str()) {
        return Verdict::Approve;
    }
    if REJECT_WORDS.contains(&word.as_str()) {
        let reason = rest.trim_start_matches(['-', ':', ',']).trim();
        return Verdict::Reject {
            reason: (!reason.is_empty()).then(|| reason.to_string()),
        };
    }
    Verdict::Unrecognized
}

/// Resolution for a free-text reply aimed at a request of `kind`.
///
/// Approvals read the text as a verdict; anything else counts as a rejection
/// carrying the text as feedback. Questions take the text as the answer.
pub fn resolution_for_text(kind: RequestKind, text: &str) -> Resolution {
    if !kind.is_approval() {
        return Resolution::Answered {
            text: text.trim().to_string(),
        };
    }
    match parse_verdict(text) {
        Verdict::Approve => Resolution::Approved,
        Verdict::Reject { reason } => Resolution::Rejected { reason },
        Verdict::Unrecognized => Resolution::Rejected {
            reason: Some(text.trim().to_string()),
        },
    }
}

pub fn button_labels(kind: RequestKind) -> (&'static str, &'static str) {
    match kind {
        RequestKind::PlanApproval => ("✅ Approve Plan", "❌ Cancel"),
        RequestKind::ChangeApproval => ("✅ Accept", "❌ Reject"),
        RequestKind::FreeformQuestion => ("✅ Yes", "❌ No"),
    }
}

/// Keeps the first `max` characters.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Keeps the last `max` characters.
pub fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

pub fn fit_message(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    format!("{}…", truncate_chars(text, MAX_MESSAGE_CHARS - 1))
}

fn display_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

pub fn plan_message(summary: &str, files_affected: &[String], task_name: Option<&str>) -> String {
    let mut lines = Vec::new();
    match task_name.filter(|n| !n.trim().is_empty()) {
        Some(name) => lines.push(format!("📋 Implementation Plan: {name}")),
        None => lines.push("📋 Implementation Plan".to_string()),
    }
    lines.push(String::new());
    lines.push(summary.to_string());

    if !files_affected.is_empty() {
        lines.push(String::new());
        lines.push("📁 Files to be modified:".to_string());
        for file in files_affected.iter().take(MAX_LISTED_FILES) {
            lines.push(format!("  • {}", display_name(file)));
        }
        if files_affected.len() > MAX_LISTED_FILES {
            lines.push(format!(
                "  ...and {} more files",
                files_affected.len() - MAX_LISTED_FILES
            ));
        }
    }

    lines.push(String::new());
    lines.push("Please review and approve to continue.".to_string());
    fit_message(&lines.join("\n"))
}

pub fn change_message(summary: &str, diff_preview: Option<&str>) -> String {
    let mut lines = vec![
        "✏️ Code Change Review".to_string(),
        String::new(),
        summary.to_string(),
    ];
    if let Some(diff) = diff_preview.filter(|d| !d.is_empty()) {
        lines.push(String::new());
        let kept = truncate_chars(diff, DIFF_PREVIEW_CHARS);
        lines.push(kept.to_string());
        if kept.len() < diff.len() {
            lines.push("... (truncated)".to_string());
        }
    }
    fit_message(&lines.join("\n"))
}

pub fn code_update_message(
    file_path: &str,
    change_type: ChangeType,
    summary: &str,
    diff_preview: Option<&str>,
) -> String {
    let mut lines = vec![
        format!(
            "{} {}: {file_path}",
            change_type.icon(),
            change_type.as_str().to_ascii_uppercase()
        ),
        String::new(),
        summary.to_string(),
    ];
    if let Some(diff) = diff_preview.filter(|d| !d.is_empty()) {
        lines.push(String::new());
        let kept = truncate_chars(diff, DIFF_PREVIEW_CHARS);
        lines.push(kept.to_string());
        if kept.len() < diff.len() {
            lines.push("... (truncated)".to_string());
        }
    }
    fit_message(&lines.join("\n"))
}

/// Prompt queued when the task file changes.
pub fn task_file_prompt(content: &str) -> String {
    format!(
        "Task from file update:\n\n{}\n\nWhen this task is complete, reply with \
         'Ready for next task' so the user knows to update the file again.",
        content.trim()
    )
}

pub fn question_message(prompt: &str) -> String {
    fit_message(&format!("❓ {prompt}\n\nReply to this message with your answer."))
}

pub fn error_message(error: &str, stack_trace: Option<&str>, command: Option<&str>) -> String {
    let mut lines = vec!["🚨 CRITICAL ERROR".to_string(), String::new()];
    if let Some(command) = command.filter(|c| !c.is_empty()) {
        lines.push(format!("Command: {command}"));
        lines.push(String::new());
    }
    lines.push(error.to_string());
    if let Some(trace) = stack_trace.filter(|t| !t.is_empty()) {
        lines.push(String::new());
        lines.push(tail_chars(trace, STACK_TRACE_CHARS).to_string());
    }
    fit_message(&lines.join("\n"))
}

pub fn progress_bar(percent: u8) -> String {
    let percent = usize::from(percent.min(100));
    let filled = PROGRESS_CELLS * percent / 100;
    format!(
        "{}{}",
        "▓".repeat(filled),
        "░".repeat(PROGRESS_CELLS - filled)
    )
}

pub fn status_message(status_text: &str, progress_percent: Option<u8>) -> String {
    let header = match progress_percent {
        Some(p) => format!("🔨 [{}] {}%", progress_bar(p), p.min(100)),
        None => "🔨 In Progress...".to_string(),
    };
    fit_message(&format!("{header}\n\n{status_text}"))
}

pub fn completion_message(
    summary: &str,
    files_changed: Option<u32>,
    duration: Option<&str>,
) -> String {
    let mut lines = vec![
        "✅ Task Completed".to_string(),
        String::new(),
        summary.to_string(),
    ];
    let duration = duration.filter(|d| !d.is_empty());
    if files_changed.is_some() || duration.is_some() {
        lines.push(String::new());
        if let Some(count) = files_changed {
            lines.push(format!("📁 Files changed: {count}"));
        }
        if let Some(duration) = duration {
            lines.push(format!("⏱️ Duration: {duration}"));
        }
    }
    fit_message(&lines.join("\n"))
}

pub fn info_message(message: &str, priority: Priority) -> String {
    fit_message(&format!("{} {message}", priority.icon()))
}

pub fn artifact_caption(path: &Path, caption: Option<&str>) -> String {
    match caption.filter(|c| !c.trim().is_empty()) {
        Some(caption) => caption.to_string(),
        None => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            format!("📸 {name}")
        }
    }
}

/// Line appended to a request message once it is decided.
pub fn decision_line(resolution: &Resolution) -> String {
    let label = match resolution {
        Resolution::Approved => "✅ Approved".to_string(),
        Resolution::Rejected { reason: None } => "❌ Rejected".to_string(),
        Resolution::Rejected {
            reason: Some(reason),
        } => format!("❌ Rejected: {}", truncate_chars(reason, 200)),
        Resolution::Answered { .. } => "💬 Answered".to_string(),
        Resolution::TimedOut => "⌛ Timed out".to_string(),
        Resolution::Cancelled => "🛑 Cancelled".to_string(),
    };
    format!("Status: {label}")
}

/// The decision line always survives; the original text is cut to make room.
pub fn with_decision(original: &str, resolution: &Resolution) -> String {
    let suffix = format!("\n\n{}", decision_line(resolution));
    let room = MAX_MESSAGE_CHARS.saturating_sub(suffix.chars().count());
    if original.chars().count() <= room {
        return format!("{original}{suffix}");
    }
    let kept = truncate_chars(original, room.saturating_sub(1));
    format!("{kept}…{suffix}")
}

/// Text handed back to the agent for a finished request.
pub fn outcome_text(kind: RequestKind, resolution: &Resolution) -> String {
    match (kind, resolution) {
        (RequestKind::PlanApproval, Resolution::Approved) => {
            "Plan approved by user. Proceeding with implementation.".to_string()
        }
        (RequestKind::PlanApproval, Resolution::Rejected { reason }) => format!(
            "Plan rejected by user. Reason: {}. Do not proceed with the changes.",
            reason.as_deref().unwrap_or("No reason provided")
        ),
        (RequestKind::PlanApproval, Resolution::Answered { text }) => format!(
            "Plan rejected by user. Reason: {text}. Do not proceed with the changes."
        ),
        (RequestKind::PlanApproval, Resolution::TimedOut) => {
            "No response to the plan within the timeout. Treat the plan as rejected and do not \
             proceed with the changes."
                .to_string()
        }
        (RequestKind::PlanApproval, Resolution::Cancelled) => {
            "Plan approval was cancelled before the user decided. Do not proceed with the changes."
                .to_string()
        }
        (RequestKind::ChangeApproval, Resolution::Approved) => {
            "Changes approved by user.".to_string()
        }
        (RequestKind::ChangeApproval, Resolution::Rejected { reason }) => format!(
            "Changes rejected by user. Feedback: {}.",
            reason.as_deref().unwrap_or("No feedback provided")
        ),
        (RequestKind::ChangeApproval, Resolution::Answered { text }) => {
            format!("Changes rejected by user. Feedback: {text}.")
        }
        (RequestKind::ChangeApproval, Resolution::TimedOut) => {
            "No response to the change request within the timeout. Treat the changes as rejected."
                .to_string()
        }
        (RequestKind::ChangeApproval, Resolution::Cancelled) => {
            "Change approval was cancelled before the user decided. Treat the changes as rejected."
                .to_string()
        }
        (RequestKind::FreeformQuestion, Resolution::Answered { text }) => {
            format!("User response: {text}")
        }
        (RequestKind::FreeformQuestion, Resolution::Approved) => {
            "User response: approved".to_string()
        }
        (RequestKind::FreeformQuestion, Resolution::Rejected { reason }) => match reason {
            Some(reason) => format!("User response: rejected ({reason})"),
            None => "User response: rejected".to_string(),
        },
        (RequestKind::FreeformQuestion, Resolution::TimedOut) => {
            "No response received (timed out)".to_string()
        }
        (RequestKind::FreeformQuestion, Resolution::Cancelled) => {
            "Question cancelled before the user answered.".to_string()
        }
    }
}

pub fn prompt_list_text(prompts: &[QueuedPrompt]) -> String {
    if prompts.is_empty() {
        return "No pending prompts from Telegram.".to_string();
    }
    let mut lines = vec![format!(
        "Found {} pending prompt(s) from Telegram:",
        prompts.len()
    )];
    lines.push(String::new());
    for (idx, prompt) in prompts.iter().enumerate() {
        lines.push(format!("{}. {}", idx + 1, prompt.text));
        let received = parse_rfc3339(&prompt.enqueued_at)
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| prompt.enqueued_at.clone());
        lines.push(format!("   Received: {received}"));
    }
    lines.join("\n")
}

pub fn prompt_ack(text: &str) -> String {
    let preview = truncate_chars(text, 80);
    let ellipsis = if preview.len() < text.len() { "..." } else { "" };
    format!("🚀 Task queued for the agent.\n\n📝 {preview}{ellipsis}")
}

pub fn help_text() -> String {
    [
        "🚀 Mobile command bridge",
        "",
        "Commands:",
        "• /prompt <task> - queue a task for the agent",
        "• /approve - approve the latest pending request",
        "• /reject [reason] - reject the latest pending request",
        "• /cancel - cancel the latest pending request and clear the status ticker",
        "• /status - show bridge status",
        "• /help - show this message",
        "",
        "Reply to a request message to answer it directly.",
    ]
    .join("\n")
}

pub fn status_report(
    last_status: Option<(&str, Option<u8>, &str)>,
    pending_requests: usize,
    queued_prompts: usize,
) -> String {
    let mut lines = vec!["📊 Current Status".to_string(), String::new()];
    match last_status {
        Some((text, progress, at)) => {
            let progress = progress
                .map(|p| format!(" ({}%)", p.min(100)))
                .unwrap_or_default();
            lines.push(format!("Last update{progress}: {text}"));
            lines.push(format!("Reported at: {at}"));
        }
        None => lines.push("No active tasks.".to_string()),
    }
    lines.push(format!("Pending approvals: {pending_requests}"));
    lines.push(format!("Queued prompts: {queued_prompts}"));
    if last_status.is_none() && pending_requests == 0 {
        lines.push(String::new());
        lines.push("Send /prompt <your task> to start.".to_string());
    }
    lines.join("\n")
}

/// SHA-256 of `bytes`, lowercase hex.
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
