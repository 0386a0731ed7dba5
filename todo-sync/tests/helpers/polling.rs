//! Bounded waits on a running sync runtime.

#![allow(dead_code)]

use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::broadcast::{self, error::RecvError};

use todo_sync_lib::session::reducer::ViewUpdate;
use todo_sync_lib::session::runtime::{Snapshot, SyncHandle};

pub const WAIT: Duration = Duration::from_secs(5);

const INITIAL_DELAY_MS: u64 = 5;
const MAX_DELAY_MS: u64 = 100;

/// Error returned when a condition never held
#[derive(Debug)]
pub struct WaitError {
    what: String,
    attempts: u32,
    waited: Duration,
    last: String,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timed out after {} attempts over {:?} waiting for {}. Last seen: {}",
            self.attempts, self.waited, self.what, self.last
        )
    }
}

impl std::error::Error for WaitError {}

/// Poll `f` with exponential backoff (5ms doubling to 100ms) until it yields a value.
pub async fn poll_until<T, F>(what: &str, timeout: Duration, mut f: F) -> Result<T, WaitError>
where
    F: FnMut() -> Result<T, String>,
{
    let start = Instant::now();
    let mut delay = Duration::from_millis(INITIAL_DELAY_MS);
    let mut attempts = 0;

    loop {
        attempts += 1;
        let last = match f() {
            Ok(value) => return Ok(value),
            Err(last) => last,
        };

        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(WaitError {
                what: what.to_string(),
                attempts,
                waited: start.elapsed(),
                last,
            });
        }

        tokio::time::sleep(delay.min(remaining)).await;
        delay = (delay * 2).min(Duration::from_millis(MAX_DELAY_MS));
    }
}

/// Wait until the runtime's snapshot satisfies `pred`
pub async fn snapshot_where<F>(handle: &SyncHandle, what: &str, pred: F) -> Snapshot
where
    F: Fn(&Snapshot) -> bool,
{
    poll_until(what, WAIT, || {
        let snapshot = handle.snapshot();
        if pred(&snapshot) {
            Ok(snapshot)
        } else {
            Err(format!("{:?}", snapshot))
        }
    })
    .await
    .unwrap_or_else(|e| panic!("{}", e))
}

/// Task texts with completion flags of the rendered list, if any
pub fn rendered(snapshot: &Snapshot) -> Option<Vec<(String, bool)>> {
    snapshot.view.as_ref().map(|view| {
        view.tasks
            .iter()
            .map(|t| (t.text.clone(), t.completed))
            .collect()
    })
}

/// Next update `pick` accepts, skipping everything else
pub async fn next_update<T>(
    updates: &mut broadcast::Receiver<ViewUpdate>,
    what: &str,
    mut pick: impl FnMut(&ViewUpdate) -> Option<T>,
) -> T {
    let waited = tokio::time::timeout(WAIT, async {
        loop {
            match updates.recv().await {
                Ok(update) => {
                    if let Some(value) = pick(&update) {
                        return value;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("runtime stopped while waiting for {}", what),
            }
        }
    })
    .await;
    waited.unwrap_or_else(|_| panic!("Timed out waiting for {}", what))
}
