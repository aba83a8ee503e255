//! Admission control for slash commands.

use tracing::debug;

use super::bin::TokenBin;
use crate::config::LimitsConfig;
use crate::error::Result;
use crate::ids::{ChannelId, GuildId, UserId};

/// Outcome of asking the gate whether a command may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Run the command
    Allowed,
    /// The invoking user is over their per-guild budget
    UserThrottled,
    /// The channel is over its budget
    ChannelThrottled,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    /// Ephemeral notice to show the invoker instead of running the command.
    pub fn notice(&self) -> Option<&'static str> {
        match self {
            Admission::Allowed => None,
            Admission::UserThrottled => {
                Some("You are using too many commands too quickly. Calm down.")
            }
            Admission::ChannelThrottled => {
                Some("Too many commands being processed in this channel right now. Please wait.")
            }
        }
    }
}

/// Charges the per-user bin and then the per-channel bin for each command.
#[derive(Debug)]
pub struct CommandGate {
    users: TokenBin<GuildId, UserId>,
    channels: TokenBin<GuildId, ChannelId>,
}

impl CommandGate {
    pub fn new(users: TokenBin<GuildId, UserId>, channels: TokenBin<GuildId, ChannelId>) -> Self {
        Self { users, channels }
    }

    /// Build both bins from configuration. Requires a Tokio runtime.
    pub fn from_config(config: &LimitsConfig) -> Result<Self> {
        let users = TokenBin::new(
            "user",
            config.user.capacity,
            config.user.decay_interval(),
        )?;
        let channels = TokenBin::new(
            "channel",
            config.channel.capacity,
            config.channel.decay_interval(),
        )?;
        Ok(Self::new(users, channels))
    }

    /// Decide whether `user` may run a command in `channel`.
    ///
    /// The user bin is checked first; a user denial does not charge the
    /// channel. A channel denial keeps the unit already taken from the user.
    pub fn admit(&self, guild: GuildId, user: UserId, channel: ChannelId) -> Admission {
        if !self.users.allocate(guild, user) {
            debug!(guild = %guild, user = %user, "Command throttled for user");
            return Admission::UserThrottled;
        }

        if !self.channels.allocate(guild, channel) {
            debug!(guild = %guild, channel = %channel, "Command throttled for channel");
            return Admission::ChannelThrottled;
        }

        Admission::Allowed
    }

    pub fn users(&self) -> &TokenBin<GuildId, UserId> {
        &self.users
    }

    pub fn channels(&self) -> &TokenBin<GuildId, ChannelId> {
        &self.channels
    }

    /// Stop the decay drivers of both bins.
    pub async fn shutdown(&self) {
        self.users.shutdown().await;
        self.channels.shutdown().await;
    }
}
