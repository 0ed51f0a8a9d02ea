use std::future::Future;
use std::sync::Mutex;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ConsumerError;

/// Runs every task concurrently and waits for all of them.
///
/// Each task gets a child of `cancel`. The first task to fail cancels all of
/// its siblings and its error is returned once they have wound down.
pub async fn cancel_on_first_error<I, F, Fut>(cancel: &CancellationToken, funcs: I) -> Result<()>
where
    I: IntoIterator<Item = F>,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let token = cancel.child_token();
    let mut tasks = JoinSet::new();
    for func in funcs {
        tasks.spawn(func(token.clone()));
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(ConsumerError::TaskPanicked(e.to_string()).into()),
        };
        if let Err(err) = result {
            if first_error.is_none() {
                debug!(error = ?err, "task failed, cancelling siblings");
                token.cancel();
                first_error = Some(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Something that can be fired once.
pub trait Fire: Send + Sync {
    fn fire(&self);
}

/// One-shot completion signal. Firing more than once has no further effect.
#[derive(Debug, Clone, Default)]
pub struct Trigger {
    token: CancellationToken,
}

impl Trigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the trigger has fired.
    pub async fn fired(&self) {
        self.token.cancelled().await
    }

    /// Token cancelled when the trigger fires, usable to stop a consumer.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Fire for Trigger {
    fn fire(&self) {
        self.token.cancel();
    }
}

impl Fire for CancellationToken {
    fn fire(&self) {
        self.cancel();
    }
}

/// Restartable run signal. Each run gets a fresh token from [`Restart::next`]
/// and firing cancels the current run only.
#[derive(Debug, Default)]
pub struct Restart {
    current: Mutex<CancellationToken>,
}

impl Restart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token of the next run, a child of `parent`.
    pub fn next(&self, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        match self.current.lock() {
            Ok(mut current) => *current = token.clone(),
            Err(poisoned) => *poisoned.into_inner() = token.clone(),
        }
        token
    }
}

impl Fire for Restart {
    fn fire(&self) {
        match self.current.lock() {
            Ok(current) => current.cancel(),
            Err(poisoned) => poisoned.into_inner().cancel(),
        }
    }
}
