// =============================================================================
// Approval channel — human-in-the-loop order approval plus the peripheral
// command surface (SPEC_FULL.md §6 "Approval channel").
// =============================================================================
//
// `ApprovalChannel` is what the executor calls to gate a trade and to push
// one-way notifications; `CommandSurface` is what both the chat-bot command
// handlers and the REST control endpoints call into — pause/resume/mode
// switch/balance/positions/signal/logs are "peripheral and not part of the
// core's hot path" (SPEC_FULL.md §6), so they are modeled as a thin interface
// the executor/scheduler implement, not duplicated logic.
//
// =============================================================================

pub mod telegram;

use async_trait::async_trait;

use crate::types::{ApprovalResult, Instrument, SignalKind};

/// Out-of-band request/response for human approval, plus one-way
/// notifications. Implemented by [`telegram::TelegramApproval`] in
/// production.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Request approval for a pending order and suspend until a response
    /// arrives or the channel's configured timeout elapses.
    #[allow(clippy::too_many_arguments)]
    async fn request_approval(
        &self,
        signal_kind: SignalKind,
        instrument: Instrument,
        reason: &str,
        shares: f64,
        price: f64,
        position_value: f64,
    ) -> ApprovalResult;

    async fn send_message(&self, text: &str);
    async fn notify_trade_executed(&self, text: &str);
    async fn notify_position_closed(&self, text: &str);
    async fn notify_error(&self, text: &str);
}

/// The peripheral, out-of-band control surface. Both the Telegram command
/// handlers and the REST `/control/*` endpoints are thin callers into a
/// single implementation of this trait (held by the executor/scheduler),
/// so there is exactly one place pause/resume/mode-switch logic lives.
#[async_trait]
pub trait CommandSurface: Send + Sync {
    async fn pause(&self) -> String;
    async fn resume(&self) -> String;
    async fn set_mode(&self, mode: &str) -> String;
    async fn balance(&self) -> String;
    async fn positions(&self) -> String;
    async fn signal(&self) -> String;
    async fn logs(&self, limit: usize) -> String;
}
