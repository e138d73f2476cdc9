//! # steward-bridge
//!
//! Messaging-channel bridge for Steward: outbound notifications (split to
//! fit the channel's message limit), pending approvals with reminders, and
//! a long-polling remote-control loop for the bot-owning instance.

mod approval;
mod client;
mod control;
mod notify;

pub use approval::{ApprovalDecision, ApprovalManager};
pub use client::{split_message, BotClient, CallbackQuery, Chat, IncomingMessage, Update};
pub use control::{format_status, parse_approval_payload, parse_command, Command, ControlBridge};
pub use notify::flush_notifications;
