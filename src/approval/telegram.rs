// =============================================================================
// Telegram approval channel — inline-keyboard approve/reject rendezvous plus
// the chat-bot side of the command surface.
// =============================================================================
//
// Grounded on `original_source/src/telegram/bot.py::request_trade_approval`
// (callback-id-keyed inline keyboard, timeout falls back to a TIMEOUT
// message) and on the teloxide idiom shown in
// `other_examples/.../clawbot/src/main.rs` (`Bot::new`, `ChatId`, plain
// tokio-spawned loops rather than a dptree dispatcher).
//
// The Python original suspends on an `asyncio.Event`; the direct Rust
// analogue is a `tokio::oneshot` channel raced against `tokio::time::timeout`
// inside `request_approval`, with the matching sender resolved from
// `listen()`'s long-poll loop when the operator taps a button.
//
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, UpdateKind};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::types::{ApprovalResult, Instrument, SignalKind};

use super::{ApprovalChannel, CommandSurface};

type PendingMap = Mutex<HashMap<String, oneshot::Sender<bool>>>;

/// Telegram-backed approval channel. `chat_id` is the single operator chat
/// authorized to approve trades and issue command-surface commands
/// (SPEC_FULL.md §6 "one human operator chat id authorized to respond").
pub struct TelegramApproval {
    bot: Bot,
    chat_id: ChatId,
    approval_timeout: Duration,
    pending: PendingMap,
    commands: Arc<dyn CommandSurface>,
}

impl TelegramApproval {
    pub fn new(
        token: impl Into<String>,
        chat_id: i64,
        approval_timeout: Duration,
        commands: Arc<dyn CommandSurface>,
    ) -> Self {
        Self {
            bot: Bot::new(token.into()),
            chat_id: ChatId(chat_id),
            approval_timeout,
            pending: Mutex::new(HashMap::new()),
            commands,
        }
    }

    /// Long-poll loop; resolves pending approval rendezvous on button taps
    /// and dispatches command-surface text commands. Runs until `shutdown`
    /// is cancelled (SPEC_FULL.md §5 "cancellation-aware, must return
    /// promptly on shutdown").
    pub async fn listen(&self, shutdown: CancellationToken) {
        let mut offset: i32 = 0;

        loop {
            if shutdown.is_cancelled() {
                info!("telegram approval listener shutting down");
                return;
            }

            let updates = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = self
                    .bot
                    .get_updates()
                    .offset(offset)
                    .timeout(30)
                    .send() => result,
            };

            let updates = match updates {
                Ok(u) => u,
                Err(e) => {
                    warn!(error = %e, "telegram get_updates failed, backing off");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.id.0 as i32 + 1);
                self.handle_update(update.kind).await;
            }
        }
    }

    async fn handle_update(&self, kind: UpdateKind) {
        match kind {
            UpdateKind::CallbackQuery(cb) => {
                let Some(data) = cb.data.clone() else { return };
                let (approved, callback_id) = if let Some(id) = data.strip_prefix("approve_") {
                    (true, id.to_string())
                } else if let Some(id) = data.strip_prefix("reject_") {
                    (false, id.to_string())
                } else {
                    return;
                };

                let sender = self.pending.lock().remove(&callback_id);
                if let Some(sender) = sender {
                    let _ = sender.send(approved);
                } else {
                    warn!(callback_id, "approval callback with no matching pending request");
                }

                if let Err(e) = self.bot.answer_callback_query(cb.id).send().await {
                    warn!(error = %e, "failed to acknowledge telegram callback query");
                }
            }
            UpdateKind::Message(msg) => {
                if msg.chat.id != self.chat_id {
                    return;
                }
                let Some(text) = msg.text() else { return };
                if let Some(reply) = self.dispatch_command(text).await {
                    if let Err(e) = self.bot.send_message(self.chat_id, reply).send().await {
                        warn!(error = %e, "failed to send command reply");
                    }
                }
            }
            _ => {}
        }
    }

    async fn dispatch_command(&self, text: &str) -> Option<String> {
        let mut parts = text.trim().splitn(2, char::is_whitespace);
        let cmd = parts.next()?;
        let arg = parts.next().unwrap_or("").trim();

        let reply = match cmd {
            "/pause" => self.commands.pause().await,
            "/resume" => self.commands.resume().await,
            "/mode" => self.commands.set_mode(arg).await,
            "/balance" => self.commands.balance().await,
            "/positions" => self.commands.positions().await,
            "/signal" => self.commands.signal().await,
            "/logs" => {
                let limit = arg.parse().unwrap_or(20);
                self.commands.logs(limit).await
            }
            _ => return None,
        };
        Some(reply)
    }
}

#[async_trait]
impl ApprovalChannel for TelegramApproval {
    async fn request_approval(
        &self,
        signal_kind: SignalKind,
        instrument: Instrument,
        reason: &str,
        shares: f64,
        price: f64,
        position_value: f64,
    ) -> ApprovalResult {
        let callback_id = Uuid::new_v4().simple().to_string();

        let message = format!(
            "*{} SIGNAL*\n\n\
             Details:\n\
             • Reason: {reason}\n\
             • Instrument: {instrument}\n\
             • Shares: {shares}\n\
             • Price: ${price:.2}\n\
             • Total: ${position_value:.2}\n\n\
             Timeout: {} minutes",
            signal_kind.as_str().to_uppercase(),
            self.approval_timeout.as_secs() / 60,
        );

        let keyboard = InlineKeyboardMarkup::new(vec![vec![
            InlineKeyboardButton::callback("APPROVE", format!("approve_{callback_id}")),
            InlineKeyboardButton::callback("REJECT", format!("reject_{callback_id}")),
        ]]);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(callback_id.clone(), tx);

        let send_result = self
            .bot
            .send_message(self.chat_id, message)
            .reply_markup(keyboard)
            .send()
            .await;

        if let Err(e) = send_result {
            error!(error = %e, "failed to send approval request");
            self.pending.lock().remove(&callback_id);
            return ApprovalResult::Error;
        }

        match tokio::time::timeout(self.approval_timeout, rx).await {
            Ok(Ok(true)) => ApprovalResult::Approved,
            Ok(Ok(false)) => ApprovalResult::Rejected,
            Ok(Err(_)) => ApprovalResult::Error,
            Err(_) => {
                self.pending.lock().remove(&callback_id);
                self.send_message(&format!(
                    "TIMEOUT\n\nNo response received for {}. Trade skipped.",
                    signal_kind.as_str()
                ))
                .await;
                ApprovalResult::Timeout
            }
        }
    }

    async fn send_message(&self, text: &str) {
        if let Err(e) = self.bot.send_message(self.chat_id, text.to_string()).send().await {
            warn!(error = %e, "failed to send telegram message");
        }
    }

    async fn notify_trade_executed(&self, text: &str) {
        self.send_message(text).await;
    }

    async fn notify_position_closed(&self, text: &str) {
        self.send_message(text).await;
    }

    async fn notify_error(&self, text: &str) {
        self.send_message(text).await;
    }
}
