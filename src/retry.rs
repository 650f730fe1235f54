// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A bounded, reachability-gated retry helper.
//!
//! This is the one piece of retry logic in the crate that isn't open-ended:
//! [`crate::socket::Socket`]'s own reconnect loop calls it with an effectively unlimited
//! attempt count, but it is written so any bounded, one-shot operation (a handshake, a single
//! RPC) can reuse the same gate-then-retry shape.

use std::future::Future;
use std::time::Duration;

use crate::reachability::Reachability;

/// Run `op` until it succeeds or `max_attempts` have been made, sleeping for durations drawn
/// from `policy` between attempts and waiting for the network to be reachable before the
/// first attempt.
///
/// Reachability is checked only once, up front: a drop mid-retry does not pause the loop or
/// reset the attempt counter, since by the time a drop is observed the operation is typically
/// already mid-flight and the transport layer (not this helper) is responsible for reacting
/// to it. The last attempt's error is returned verbatim; none of the intermediate errors are
/// retained.
pub async fn auto_retry<F, Fut, T, E>(
    oracle: &dyn Reachability,
    max_attempts: usize,
    mut policy: impl Iterator<Item = Duration>,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    oracle.await_up().await;

    let max_attempts = max_attempts.max(1);
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts {
                    return Err(err);
                }
                let wait = policy.next().unwrap_or(Duration::from_secs(1));
                tokio::time::sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reachability::AlwaysOnline;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let oracle = AlwaysOnline::default();
        let calls = AtomicUsize::new(0);
        let result: Result<(), &str> = auto_retry(
            &oracle,
            5,
            std::iter::repeat(Duration::from_millis(1)),
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("not yet")
                } else {
                    Ok(())
                }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_and_returns_last_error() {
        let oracle = AlwaysOnline::default();
        let calls = AtomicUsize::new(0);
        let result: Result<(), usize> = auto_retry(
            &oracle,
            3,
            std::iter::repeat(Duration::from_millis(1)),
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(n)
            },
        )
        .await;

        assert_eq!(result, Err(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
