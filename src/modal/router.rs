//! Routing modal submissions back to the handler that asked for them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::secrets::SecretTable;
use crate::error::{Result, WardenError};
use crate::ids::{GuildId, UserId};

/// Shown when a submission cannot be matched to a prompt we issued.
pub const ACCESS_DENIED: &str = "Sorry, access was denied. Took too long to respond?";

/// Shown when the prompt was ours but its handler has gone away.
pub const UNHANDLED: &str = "Sorry, that form could not be processed.";

/// A message sent back in response to an interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub content: String,
    /// Only visible to the user who submitted
    pub ephemeral: bool,
}

impl Reply {
    pub fn ephemeral(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ephemeral: true,
        }
    }

    pub fn public(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ephemeral: false,
        }
    }
}

/// A filled-in modal as received from the platform.
#[derive(Debug, Clone)]
pub struct ModalSubmission {
    /// The correlation token the prompt carried
    pub token: String,
    /// Who submitted it
    pub user: UserId,
    /// Where it was submitted
    pub guild: GuildId,
    /// Text inputs keyed by their field id
    pub fields: HashMap<String, String>,
}

impl ModalSubmission {
    pub fn new(token: impl Into<String>, user: UserId, guild: GuildId) -> Self {
        Self {
            token: token.into(),
            user,
            guild,
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Handles the submissions of one kind of modal.
#[async_trait]
pub trait ModalHandler: Send + Sync {
    async fn handle(&self, submission: &ModalSubmission) -> Reply;
}

/// What happened to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModalOutcome {
    /// The handler ran and produced a reply
    Handled(Reply),
    /// Unknown, already used or expired token
    Denied,
    /// The token was issued to somebody else; it is now spent
    WrongUser,
    /// The token named a handler that is not registered
    Unhandled(String),
}

impl ModalOutcome {
    /// The reply to send back to the submitter.
    ///
    /// A wrong-user submission gets the same answer as an unknown token.
    pub fn into_reply(self) -> Reply {
        match self {
            ModalOutcome::Handled(reply) => reply,
            ModalOutcome::Denied | ModalOutcome::WrongUser => Reply::ephemeral(ACCESS_DENIED),
            ModalOutcome::Unhandled(_) => Reply::ephemeral(UNHANDLED),
        }
    }
}

/// Issues modal tokens and routes the answers to registered handlers.
pub struct ModalRouter {
    handlers: RwLock<HashMap<String, Arc<dyn ModalHandler>>>,
    secrets: SecretTable<UserId, GuildId>,
}

impl ModalRouter {
    pub fn new(secrets: SecretTable<UserId, GuildId>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            secrets,
        }
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, handler: impl ModalHandler + 'static) {
        let name = name.into();
        debug!(handler = %name, "Registering modal handler");
        self.handlers.write().insert(name, Arc::new(handler));
    }

    /// Names of all registered handlers, sorted.
    pub fn handlers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn secrets(&self) -> &SecretTable<UserId, GuildId> {
        &self.secrets
    }

    /// Issue the correlation token for a modal that `user` is about to be shown.
    pub fn prompt(&self, handler: &str, user: UserId, guild: GuildId) -> Result<String> {
        if !self.handlers.read().contains_key(handler) {
            return Err(WardenError::UnknownHandler(handler.to_string()));
        }
        Ok(self.secrets.issue(handler, user, guild))
    }

    /// Match a submission to its prompt and run the handler.
    pub async fn submit(&self, submission: &ModalSubmission) -> ModalOutcome {
        let Some(secret) = self.secrets.claim(&submission.token) else {
            info!(
                guild = %submission.guild,
                user = %submission.user,
                "Expired or invalid modal token"
            );
            return ModalOutcome::Denied;
        };

        if secret.user != submission.user {
            warn!(
                guild = %submission.guild,
                user = %submission.user,
                expected = %secret.user,
                handler = %secret.handler,
                "Modal submission from wrong user"
            );
            return ModalOutcome::WrongUser;
        }

        let handler = self.handlers.read().get(&secret.handler).cloned();
        match handler {
            Some(handler) => {
                debug!(guild = %submission.guild, handler = %secret.handler, "Routing modal submission");
                ModalOutcome::Handled(handler.handle(submission).await)
            }
            None => {
                warn!(guild = %submission.guild, handler = %secret.handler, "Unknown modal handler");
                ModalOutcome::Unhandled(secret.handler)
            }
        }
    }
}

impl std::fmt::Debug for ModalRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModalRouter")
            .field("handlers", &self.handlers())
            .field("secrets", &self.secrets)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const GUILD: GuildId = GuildId(100);
    const ASKER: UserId = UserId(1);

    /// Echoes the "title" field back and counts invocations.
    #[derive(Default)]
    struct EchoTitle {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ModalHandler for EchoTitle {
        async fn handle(&self, submission: &ModalSubmission) -> Reply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Reply::public(format!("Saved {}", submission.field("title").unwrap_or("?")))
        }
    }

    fn router() -> (Arc<ManualClock>, ModalRouter, Arc<AtomicUsize>) {
        let clock = Arc::new(ManualClock::new());
        let secrets = SecretTable::new(Duration::from_secs(900), clock.clone()).unwrap();
        let router = ModalRouter::new(secrets);

        let calls = Arc::new(AtomicUsize::new(0));
        router.register("faqadd", EchoTitle { calls: calls.clone() });
        (clock, router, calls)
    }

    #[tokio::test]
    async fn test_submission_routed_to_handler() {
        let (_clock, router, calls) = router();
        let token = router.prompt("faqadd", ASKER, GUILD).unwrap();

        let submission = ModalSubmission::new(token, ASKER, GUILD).with_field("title", "rules");
        let outcome = router.submit(&submission).await;

        assert_eq!(outcome, ModalOutcome::Handled(Reply::public("Saved rules")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_replayed_submission_denied() {
        let (_clock, router, calls) = router();
        let token = router.prompt("faqadd", ASKER, GUILD).unwrap();
        let submission = ModalSubmission::new(token, ASKER, GUILD);

        router.submit(&submission).await;
        let outcome = router.submit(&submission).await;

        assert_eq!(outcome, ModalOutcome::Denied);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrong_user_consumes_token() {
        let (_clock, router, calls) = router();
        let token = router.prompt("faqadd", ASKER, GUILD).unwrap();

        let intruder = ModalSubmission::new(token.clone(), UserId(2), GUILD);
        assert_eq!(router.submit(&intruder).await, ModalOutcome::WrongUser);

        // The rightful user can no longer use it either
        let asker = ModalSubmission::new(token, ASKER, GUILD);
        assert_eq!(router.submit(&asker).await, ModalOutcome::Denied);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wrong_user_reply_matches_unknown_token() {
        assert_eq!(
            ModalOutcome::WrongUser.into_reply(),
            ModalOutcome::Denied.into_reply()
        );
        assert_eq!(ModalOutcome::Denied.into_reply(), Reply::ephemeral(ACCESS_DENIED));
    }

    #[tokio::test]
    async fn test_expired_prompt_denied() {
        let (clock, router, _calls) = router();
        let token = router.prompt("faqadd", ASKER, GUILD).unwrap();

        clock.advance(Duration::from_secs(16 * 60));
        router.secrets().sweep();

        let outcome = router.submit(&ModalSubmission::new(token, ASKER, GUILD)).await;
        assert_eq!(outcome, ModalOutcome::Denied);
    }

    #[test]
    fn test_prompt_unknown_handler() {
        let (_clock, router, _calls) = router();

        let result = router.prompt("nope", ASKER, GUILD);
        assert!(matches!(result, Err(WardenError::UnknownHandler(name)) if name == "nope"));
        assert!(router.secrets().is_empty());
    }

    #[tokio::test]
    async fn test_handler_removed_after_prompt() {
        let clock = Arc::new(ManualClock::new());
        let secrets = SecretTable::new(Duration::from_secs(900), clock).unwrap();
        let token = secrets.issue("gone", ASKER, GUILD);
        let router = ModalRouter::new(secrets);

        let outcome = router.submit(&ModalSubmission::new(token, ASKER, GUILD)).await;

        assert_eq!(outcome, ModalOutcome::Unhandled("gone".to_string()));
        assert_eq!(outcome.into_reply(), Reply::ephemeral(UNHANDLED));
    }

    #[test]
    fn test_handlers_listed() {
        let (_clock, router, _calls) = router();
        router.register("vote", EchoTitle::default());

        assert_eq!(router.handlers(), vec!["faqadd".to_string(), "vote".to_string()]);
    }
}
