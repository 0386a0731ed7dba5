//! Test helpers for the async sync runtime
//!
//! Only compiled in test builds. Waiting is always bounded so a broken
//! runtime fails the test with a description instead of hanging it.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::session::runtime::Snapshot;

/// Retry `f` every `interval` until it returns `Ok`, panicking after `timeout`.
///
/// ```rust,ignore
/// assert_eventually("lists to load", Duration::from_secs(2), Duration::from_millis(10), || {
///     let snapshot = handle.snapshot();
///     async move { if snapshot.context.lists().is_empty() { Err("none") } else { Ok(()) } }
/// }).await;
/// ```
pub async fn assert_eventually<F, Fut, T, E>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let start = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return value,
            Err(e) if start.elapsed() >= timeout => panic!(
                "Timeout waiting for {}\n\
                 Duration: {:?}\n\
                 Attempts: {}\n\
                 Last error: {}",
                desc,
                start.elapsed(),
                attempt,
                e
            ),
            Err(_) => tokio::time::sleep(interval).await,
        }
    }
}

/// Wait until a published snapshot satisfies `pred` and return it.
///
/// Unlike polling this sees every snapshot the runtime publishes.
pub async fn wait_for_snapshot<F>(
    desc: &str,
    snapshots: &mut watch::Receiver<Snapshot>,
    timeout: Duration,
    mut pred: F,
) -> Snapshot
where
    F: FnMut(&Snapshot) -> bool,
{
    let waited = tokio::time::timeout(timeout, async {
        loop {
            {
                let current = snapshots.borrow_and_update();
                if pred(&current) {
                    return Some(current.clone());
                }
            }
            if snapshots.changed().await.is_err() {
                return None;
            }
        }
    })
    .await;

    match waited {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => panic!("Runtime stopped while waiting for {}", desc),
        Err(_) => panic!(
            "Timeout waiting for {}\nLast snapshot: {:?}",
            desc,
            *snapshots.borrow()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_assert_eventually_succeeds_after_retries() {
        let counter = Arc::new(AtomicUsize::new(0));
        let result = assert_eventually(
            "counter to reach 3",
            Duration::from_secs(2),
            Duration::from_millis(5),
            || {
                let c = Arc::clone(&counter);
                async move {
                    let val = c.fetch_add(1, Ordering::SeqCst);
                    if val >= 2 {
                        Ok(val)
                    } else {
                        Err(format!("counter only at {}", val))
                    }
                }
            },
        )
        .await;
        assert!(result >= 2);
    }

    #[tokio::test]
    #[should_panic(expected = "Timeout waiting for never succeeds")]
    async fn test_assert_eventually_times_out() {
        assert_eventually(
            "never succeeds",
            Duration::from_millis(50),
            Duration::from_millis(10),
            || async { Err::<(), _>("always fails") },
        )
        .await;
    }

    #[tokio::test]
    async fn test_wait_for_snapshot_sees_later_value() {
        let (tx, mut rx) = watch::channel(Snapshot::default());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut manager = crate::session::manager::SessionManager::new();
            manager.sign_in("alice");
            tx.send_replace(Snapshot {
                context: manager.context().clone(),
                view: None,
            });
        });
        let snapshot = wait_for_snapshot("sign in", &mut rx, Duration::from_secs(2), |s| {
            s.context.is_signed_in()
        })
        .await;
        assert_eq!(snapshot.context.user(), Some("alice"));
    }
}
