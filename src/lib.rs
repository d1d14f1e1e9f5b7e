//! hearth: a personal assistant reachable over WhatsApp.
//!
//! The core keeps one bridge connection alive, gates access behind a
//! whitelist with brute-force-guarded pairing, delivers proactive messages
//! through a durable retrying outbox, and runs periodic tasks with failure
//! escalation.
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod store;

pub mod assistant;
pub mod channel;
pub mod whatsapp;

pub mod heartbeat;
pub mod outbox;
