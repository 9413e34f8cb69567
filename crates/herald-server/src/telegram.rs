use std::path::Path;

use async_trait::async_trait;
use herald_contracts::{ChoiceSet, ConversationId, InboundEvent, MessageRef};
use herald_kernel as kernel;
use teloxide::dispatching::ShutdownToken;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MaybeInaccessibleMessage, Message,
    MessageId,
};
use teloxide::{ApiError, RequestError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, TransportError};
use crate::notifier::ChatTransport;
use crate::router::ResponseRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Media {
    Photo,
    Video,
    Document,
}

fn media_for(path: &Path) -> Media {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" | "jpg" | "jpeg" | "webp" => Media::Photo,
        "mp4" | "mov" | "webm" => Media::Video,
        _ => Media::Document,
    }
}

fn classify(err: RequestError) -> TransportError {
    match err {
        RequestError::Network(_) | RequestError::RetryAfter(_) | RequestError::Io(_) => {
            TransportError::Retryable(err.to_string())
        }
        other => TransportError::Rejected(other.to_string()),
    }
}

fn keyboard(choices: &ChoiceSet) -> InlineKeyboardMarkup {
    let row = choices
        .buttons
        .iter()
        .map(|b| {
            InlineKeyboardButton::callback(
                b.label.clone(),
                kernel::encode_callback(&choices.request_id, b.choice),
            )
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(vec![row])
}

fn message_ref(msg: &Message) -> MessageRef {
    MessageRef {
        conversation: ConversationId(msg.chat.id.0),
        message_id: msg.id.0,
    }
}

/// Bot API implementation of the outbound side.
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_text(
        &self,
        conversation: ConversationId,
        text: &str,
        choices: Option<&ChoiceSet>,
    ) -> Result<MessageRef, TransportError> {
        let mut request = self.bot.send_message(ChatId(conversation.0), text);
        if let Some(choices) = choices.filter(|c| !c.buttons.is_empty()) {
            request = request.reply_markup(keyboard(choices));
        }
        let sent = request.await.map_err(classify)?;
        Ok(message_ref(&sent))
    }

    async fn edit_text(&self, message: MessageRef, text: &str) -> Result<(), TransportError> {
        match self
            .bot
            .edit_message_text(
                ChatId(message.conversation.0),
                MessageId(message.message_id),
                text,
            )
            .await
        {
            Ok(_) | Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
            Err(err) => Err(classify(err)),
        }
    }

    async fn send_file(
        &self,
        conversation: ConversationId,
        path: &Path,
        caption: &str,
    ) -> Result<MessageRef, TransportError> {
        let chat = ChatId(conversation.0);
        let file = InputFile::file(path.to_path_buf());
        let sent = match media_for(path) {
            Media::Photo => self.bot.send_photo(chat, file).caption(caption).await,
            Media::Video => self.bot.send_video(chat, file).caption(caption).await,
            Media::Document => self.bot.send_document(chat, file).caption(caption).await,
        }
        .map_err(classify)?;
        Ok(message_ref(&sent))
    }
}

/// Creates the bot and checks the token with `getMe`.
pub async fn connect(token: String) -> Result<Bot, BridgeError> {
    let bot = Bot::new(token);
    let me = bot
        .get_me()
        .await
        .map_err(|e| BridgeError::Startup(format!("telegram getMe failed: {e}")))?;
    info!(
        username = me.user.username.as_deref().unwrap_or("unknown"),
        "telegram bot connected"
    );
    Ok(bot)
}

/// Text messages become commands or plain text; anything else is ignored.
pub fn inbound_from_message(msg: &Message) -> Option<InboundEvent> {
    let text = msg.text()?;
    let conversation = ConversationId(msg.chat.id.0);
    if let Some(command) = kernel::parse_command(text) {
        return Some(InboundEvent::Command {
            conversation,
            name: command.name,
            args: command.args,
        });
    }
    Some(InboundEvent::PlainText {
        conversation,
        text: text.to_string(),
        reply_to: msg.reply_to_message().map(message_ref),
    })
}

fn inbound_from_callback(q: &CallbackQuery) -> Option<InboundEvent> {
    let data = q.data.clone()?;
    let (conversation, message) = match &q.message {
        Some(MaybeInaccessibleMessage::Regular(m)) => {
            (ConversationId(m.chat.id.0), Some(message_ref(m)))
        }
        _ => match private_chat(q.from.id.0) {
            Some(conversation) => (conversation, None),
            None => {
                warn!(user_id = q.from.id.0, "callback user id out of range, dropped");
                return None;
            }
        },
    };
    Some(InboundEvent::ButtonCallback {
        conversation,
        data,
        message,
    })
}

/// A private chat shares its id with the user; ids past `i64::MAX` have no chat.
fn private_chat(user_id: u64) -> Option<ConversationId> {
    i64::try_from(user_id).ok().map(ConversationId)
}

/// Starts long polling; updates are routed through `router`.
pub fn spawn_dispatcher(bot: Bot, router: ResponseRouter) -> (ShutdownToken, JoinHandle<()>) {
    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint({
            let router = router.clone();
            move |msg: Message| {
                let router = router.clone();
                async move {
                    if let Some(event) = inbound_from_message(&msg) {
                        let outcome = router.route(event).await;
                        debug!(?outcome, "message routed");
                    }
                    respond(())
                }
            }
        }))
        .branch(Update::filter_callback_query().endpoint({
            let router = router.clone();
            move |q: CallbackQuery, bot: Bot| {
                let router = router.clone();
                async move {
                    let label = match inbound_from_callback(&q) {
                        Some(event) => router.route(event).await.callback_label(),
                        None => "",
                    };
                    let mut answer = bot.answer_callback_query(q.id);
                    if !label.is_empty() {
                        answer = answer.text(label);
                    }
                    if let Err(err) = answer.await {
                        debug!(error = %err, "callback answer failed");
                    }
                    respond(())
                }
            }
        }));

    let mut dispatcher = Dispatcher::builder(bot, handler).build();
    let token = dispatcher.shutdown_token();
    let handle = tokio::spawn(async move {
        dispatcher.dispatch().await;
        info!("telegram dispatcher stopped");
    });
    (token, handle)
}

/// Asks a running dispatcher to stop; a no-op if it is idle.
pub async fn stop_dispatcher(token: &ShutdownToken) {
    match token.shutdown() {
        Ok(stopping) => stopping.await,
        Err(_) => debug!("dispatcher was not running"),
    }
}
