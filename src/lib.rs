//! Warden - command throttling and modal correlation for a guild chat bot
//!
//! This crate holds the stateful core that sits between the gateway event
//! dispatcher and the command handlers: token-bucket admission control per
//! (guild, user) and (guild, channel), and single-use, time-boxed tokens that
//! tie a modal submission back to the prompt that asked for it.

pub mod clock;
pub mod config;
pub mod error;
pub mod ids;
pub mod modal;
pub mod ratelimit;
pub mod schedule;
