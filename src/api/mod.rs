// =============================================================================
// REST control surface — authenticated HTTP mirror of the chat-bot command
// surface (SPEC_FULL.md §6 "supplemental REST surface").
// =============================================================================

pub mod auth;
pub mod rest;
