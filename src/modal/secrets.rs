//! Single-use, time-boxed correlation tokens for modal prompts.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::clock::{Clock, TokioClock};
use crate::error::{Result, WardenError};
use crate::schedule::{spawn_periodic, ShutdownSignal, MAX_PERIOD};

/// Who asked for a prompt, and which handler should receive the answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret<U, G> {
    /// Name of the handler the response is routed to
    pub handler: String,
    /// The user the prompt was shown to
    pub user: U,
    /// The guild the prompt was issued in
    pub guild: G,
    /// When the token was issued
    pub created_at: Instant,
}

struct TableInner<U, G> {
    secrets: Mutex<HashMap<String, Secret<U, G>>>,
    max_age: Duration,
    clock: Arc<dyn Clock>,
}

impl<U, G> TableInner<U, G> {
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut secrets = self.secrets.lock();
        let before = secrets.len();

        secrets.retain(|_, secret| now.saturating_duration_since(secret.created_at) <= self.max_age);

        let removed = before - secrets.len();
        if removed > 0 {
            debug!(removed = removed, remaining = secrets.len(), "Swept expired modal secrets");
        }
        removed
    }
}

/// Issued-but-unclaimed modal tokens.
///
/// Every operation takes the same lock, so a token is handed out by
/// [`claim`](SecretTable::claim) at most once. Cloning shares the table.
pub struct SecretTable<U, G> {
    inner: Arc<TableInner<U, G>>,
}

impl<U, G> Clone for SecretTable<U, G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<U, G> SecretTable<U, G>
where
    U: fmt::Debug + Send + 'static,
    G: fmt::Debug + Send + 'static,
{
    /// Create a table whose secrets expire after `max_age`.
    pub fn new(max_age: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        if max_age.is_zero() {
            return Err(WardenError::InvalidLimit {
                bin: "modal secrets".to_string(),
                reason: "max age must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            inner: Arc::new(TableInner {
                secrets: Mutex::new(HashMap::new()),
                max_age,
                clock,
            }),
        })
    }

    /// Create a table measuring age on the Tokio clock.
    pub fn with_tokio_clock(max_age: Duration) -> Result<Self> {
        Self::new(max_age, Arc::new(TokioClock))
    }

    /// Register a pending prompt and return its fresh token.
    pub fn issue(&self, handler: impl Into<String>, user: U, guild: G) -> String {
        let secret = Secret {
            handler: handler.into(),
            user,
            guild,
            created_at: self.inner.clock.now(),
        };

        let mut secrets = self.inner.secrets.lock();
        loop {
            let token = Uuid::new_v4().simple().to_string();
            if let Entry::Vacant(slot) = secrets.entry(token.clone()) {
                trace!(
                    handler = %secret.handler,
                    user = ?secret.user,
                    guild = ?secret.guild,
                    "Issued modal secret"
                );
                slot.insert(secret);
                return token;
            }
        }
    }

    /// Take the secret for `token`, if it exists and has not expired.
    ///
    /// The entry is removed whatever the outcome, so a token can never be
    /// replayed.
    pub fn claim(&self, token: &str) -> Option<Secret<U, G>> {
        let secret = self.inner.secrets.lock().remove(token)?;

        let age = self
            .inner
            .clock
            .now()
            .saturating_duration_since(secret.created_at);
        if age > self.inner.max_age {
            debug!(
                handler = %secret.handler,
                age = ?age,
                "Claimed modal secret had already expired"
            );
            return None;
        }

        Some(secret)
    }

    /// Drop every secret older than the max age. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Run [`sweep`](SecretTable::sweep) every `every` until `signal` fires.
    pub fn spawn_sweeper(&self, every: Duration, signal: ShutdownSignal) -> Result<JoinHandle<()>> {
        if every.is_zero() {
            return Err(WardenError::InvalidLimit {
                bin: "modal secrets".to_string(),
                reason: "sweep interval must be greater than zero".to_string(),
            });
        }
        if every > MAX_PERIOD {
            return Err(WardenError::InvalidLimit {
                bin: "modal secrets".to_string(),
                reason: format!("sweep interval must be at most {:?}", MAX_PERIOD),
            });
        }
        let runtime = Handle::try_current().map_err(|_| WardenError::NoRuntime)?;

        debug!(every = ?every, max_age = ?self.inner.max_age, "Starting modal secret sweeper");

        let inner = Arc::clone(&self.inner);
        Ok(spawn_periodic(&runtime, every, signal, move || {
            inner.sweep();
            ControlFlow::Continue(())
        }))
    }

    /// Number of outstanding secrets.
    pub fn len(&self) -> usize {
        self.inner.secrets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_age(&self) -> Duration {
        self.inner.max_age
    }
}

impl<U, G> fmt::Debug for SecretTable<U, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretTable")
            .field("max_age", &self.inner.max_age)
            .field("outstanding", &self.inner.secrets.lock().len())
            .finish()
    }
}
