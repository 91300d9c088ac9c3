//! Invocation retry engine.
//!
//! A failed attempt is retried when its error class allows it and the
//! attempt budget is not used up. Delays grow geometrically up to a cap
//! and are scheduled on a [`RetryQueue`], which the runtime destroys on
//! shutdown.

use crate::config::RetryConfig;
use crate::error::{ErrorKind, LocalError};
use crate::invocation::InvocationFailure;
use crate::observer::Observer;
use parking_lot::Mutex;
use rpcwire_protocol::OperationMode;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Fail,
}

/// Retry limits and delay growth.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_attempts: u32,
    pub base_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_interval: config.base_interval(),
            multiplier: config.multiplier.max(1.0),
            max_interval: config.max_interval(),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (zero-based):
    /// `min(base * multiplier^retry, max_interval)`.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let nanos = self.base_interval.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= self.max_interval.as_nanos() as f64 {
            self.max_interval
        } else {
            Duration::from_nanos(nanos.round() as u64)
        }
    }

    /// Whether the failure class allows another attempt.
    ///
    /// A peer CloseConnection guarantees the request was not dispatched, so
    /// it is always retried. Other connection failures are retried only if
    /// the request never left or the operation is idempotent. A manual
    /// close is never retried.
    pub fn is_retryable(failure: &InvocationFailure, mode: OperationMode) -> bool {
        let unsent_or_idempotent = !failure.sent || mode.is_idempotent();
        match &failure.error {
            LocalError::ConnectionClosedByPeer => true,
            LocalError::ConnectionManuallyClosed { .. } => false,
            LocalError::ObjectNotExist(_) => mode.is_idempotent(),
            LocalError::NoEndpoint(_) => true,
            e => match e.kind() {
                ErrorKind::Transport | ErrorKind::ConnectionLifecycle => unsent_or_idempotent,
                _ => false,
            },
        }
    }

    /// Decides what to do after `retries` retries have already been made.
    pub fn decide(
        &self,
        failure: &InvocationFailure,
        mode: OperationMode,
        retries: u32,
    ) -> RetryDecision {
        if retries >= self.max_attempts || !Self::is_retryable(failure, mode) {
            return RetryDecision::Fail;
        }
        RetryDecision::RetryAfter(self.delay(retries))
    }
}

/// Runs `attempt` until it succeeds, fails with a non-retryable error or
/// the retry budget is spent. The last concrete error is returned.
///
/// `attempt` receives the number of retries made so far.
pub async fn invoke_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    queue: &RetryQueue,
    observer: &dyn Observer,
    operation: &str,
    mode: OperationMode,
    mut attempt: F,
) -> Result<T, LocalError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, InvocationFailure>>,
{
    let mut retries = 0;
    // Held while a retried attempt runs so that destroy() waits for it.
    let mut _running: Option<RetryGuard> = None;
    loop {
        let failure = match attempt(retries).await {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };
        match policy.decide(&failure, mode, retries) {
            RetryDecision::Fail => {
                if retries > 0 {
                    tracing::debug!(
                        "'{}' failed after {} retries: {}",
                        operation,
                        retries,
                        failure.error
                    );
                }
                observer.invocation_failed(operation, &failure.error);
                return Err(failure.error);
            }
            RetryDecision::RetryAfter(delay) => {
                tracing::debug!(
                    "retrying '{}' in {:?} (retry {} of {}): {}",
                    operation,
                    delay,
                    retries + 1,
                    policy.max_attempts,
                    failure.error
                );
                observer.invocation_retried(operation, retries + 1, &failure.error);
                _running = None;
                let ticket = queue.schedule(delay)?;
                _running = Some(ticket.wait().await?);
                retries += 1;
            }
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    destroyed: bool,
    next_id: u64,
    /// Waiting tasks; dropping the sender wakes the ticket with an error.
    scheduled: HashMap<u64, oneshot::Sender<()>>,
    running: usize,
}

#[derive(Debug, Default)]
struct QueueShared {
    state: Mutex<QueueState>,
    idle: Notify,
}

/// Timer-driven queue of delayed retries.
#[derive(Debug, Clone, Default)]
pub struct RetryQueue {
    shared: Arc<QueueShared>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a retry to fire after `delay`.
    pub fn schedule(&self, delay: Duration) -> Result<RetryTicket, LocalError> {
        let mut state = self.shared.state.lock();
        if state.destroyed {
            return Err(LocalError::RuntimeDestroyed);
        }
        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = oneshot::channel();
        state.scheduled.insert(id, tx);
        Ok(RetryTicket {
            shared: self.shared.clone(),
            id,
            deadline: Instant::now() + delay,
            canceled: rx,
        })
    }

    /// Number of retries waiting for their timer.
    pub fn scheduled(&self) -> usize {
        self.shared.state.lock().scheduled.len()
    }

    /// Number of fired retries still running.
    pub fn running(&self) -> usize {
        self.shared.state.lock().running
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.state.lock().destroyed
    }

    /// Cancels every scheduled retry and refuses new ones. Running retries
    /// are left alone.
    pub fn close(&self) {
        let canceled = {
            let mut state = self.shared.state.lock();
            state.destroyed = true;
            state.scheduled.drain().count()
        };
        if canceled > 0 {
            tracing::debug!("retry queue closed, {} scheduled retries canceled", canceled);
        }
    }

    /// Cancels every scheduled retry, lets running ones finish and returns
    /// once the queue is empty. Later schedules fail with
    /// [`LocalError::RuntimeDestroyed`].
    pub async fn destroy(&self) {
        self.close();
        loop {
            let idle = self.shared.idle.notified();
            if self.shared.state.lock().running == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// A scheduled retry.
#[derive(Debug)]
pub struct RetryTicket {
    shared: Arc<QueueShared>,
    id: u64,
    deadline: Instant,
    canceled: oneshot::Receiver<()>,
}

impl RetryTicket {
    /// Waits for the timer. The returned guard marks the retry as running
    /// until it is dropped.
    pub async fn wait(mut self) -> Result<RetryGuard, LocalError> {
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline) => {}
            _ = &mut self.canceled => return Err(LocalError::RuntimeDestroyed),
        }
        let mut state = self.shared.state.lock();
        if state.scheduled.remove(&self.id).is_none() {
            return Err(LocalError::RuntimeDestroyed);
        }
        state.running += 1;
        Ok(RetryGuard {
            shared: self.shared.clone(),
        })
    }
}

impl Drop for RetryTicket {
    fn drop(&mut self) {
        self.shared.state.lock().scheduled.remove(&self.id);
    }
}

/// Marks a fired retry as running.
#[derive(Debug)]
pub struct RetryGuard {
    shared: Arc<QueueShared>,
}

impl Drop for RetryGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.running -= 1;
        if state.running == 0 {
            self.shared.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use rpcwire_protocol::{Identity, RequestFailedInfo};
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_millis(1000),
        }
    }

    #[rstest]
    #[case::first(0, 100)]
    #[case::second(1, 200)]
    #[case::third(2, 400)]
    #[case::fourth(3, 800)]
    #[case::capped(4, 1000)]
    #[case::far(60, 1000)]
    #[case::overflow(u32::MAX, 1000)]
    fn test_delay(#[case] retry: u32, #[case] expected_ms: u64) {
        assert_eq!(policy(5).delay(retry), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_delay_non_decreasing() {
        let p = policy(5);
        let delays: Vec<_> = (0..20).map(|n| p.delay(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    fn transport_error() -> LocalError {
        LocalError::Transport {
            kind: std::io::ErrorKind::ConnectionReset,
            message: "reset".to_string(),
        }
    }

    #[rstest]
    #[case::peer_close_sent_normal(LocalError::ConnectionClosedByPeer, true, OperationMode::Normal, true)]
    #[case::manual_close(LocalError::ConnectionManuallyClosed { graceful: true }, false, OperationMode::Idempotent, false)]
    #[case::transport_unsent(transport_error(), false, OperationMode::Normal, true)]
    #[case::transport_sent_normal(transport_error(), true, OperationMode::Normal, false)]
    #[case::transport_sent_idempotent(transport_error(), true, OperationMode::Idempotent, true)]
    #[case::idle_sent_nonmutating(LocalError::ConnectionIdle, true, OperationMode::Nonmutating, true)]
    #[case::connect_timeout_unsent(LocalError::ConnectTimeout, false, OperationMode::Normal, true)]
    #[case::close_timeout_sent(LocalError::CloseTimeout, true, OperationMode::Normal, false)]
    #[case::protocol(LocalError::Protocol(rpcwire_protocol::ProtocolError::UnknownRequestId(1)), false, OperationMode::Idempotent, false)]
    #[case::invocation_timeout(LocalError::InvocationTimeout, true, OperationMode::Idempotent, false)]
    #[case::unknown(LocalError::UnknownException("x".into()), true, OperationMode::Idempotent, false)]
    #[case::queue_too_big(LocalError::QueueTooBig { size: 2, max: 1 }, false, OperationMode::Idempotent, false)]
    #[case::no_endpoint(LocalError::NoEndpoint("none".into()), false, OperationMode::Normal, true)]
    #[case::destroyed(LocalError::RuntimeDestroyed, false, OperationMode::Idempotent, false)]
    fn test_is_retryable(
        #[case] error: LocalError,
        #[case] sent: bool,
        #[case] mode: OperationMode,
        #[case] expected: bool,
    ) {
        let failure = InvocationFailure { error, sent };
        assert_eq!(RetryPolicy::is_retryable(&failure, mode), expected);
    }

    #[test]
    fn test_object_not_exist_only_idempotent() {
        let failure = InvocationFailure::sent(LocalError::ObjectNotExist(RequestFailedInfo {
            identity: Identity::new("o"),
            facet: String::new(),
            operation: "op".to_string(),
        }));
        assert!(RetryPolicy::is_retryable(&failure, OperationMode::Idempotent));
        assert!(!RetryPolicy::is_retryable(&failure, OperationMode::Normal));
    }

    #[test]
    fn test_decide_respects_budget() {
        let p = policy(2);
        let failure = InvocationFailure::sent(LocalError::ConnectionClosedByPeer);
        assert_eq!(
            p.decide(&failure, OperationMode::Normal, 0),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            p.decide(&failure, OperationMode::Normal, 1),
            RetryDecision::RetryAfter(Duration::from_millis(200))
        );
        assert_eq!(
            p.decide(&failure, OperationMode::Normal, 2),
            RetryDecision::Fail
        );
        assert_eq!(
            RetryPolicy::none().decide(&failure, OperationMode::Normal, 0),
            RetryDecision::Fail
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_retries_then_returns_last_error() {
        let queue = RetryQueue::new();
        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), LocalError> =
            invoke_with_retry(&policy(3), &queue, &NoopObserver, "op", OperationMode::Idempotent, |n| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    let error = if n < 3 {
                        LocalError::ConnectionIdle
                    } else {
                        transport_error()
                    };
                    Err(InvocationFailure::sent(error))
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(result, Err(transport_error()));
        // 100 + 200 + 400 ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(700));
        assert_eq!(queue.scheduled(), 0);
        assert_eq!(queue.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sent_non_idempotent_not_retried() {
        let queue = RetryQueue::new();
        let attempts = AtomicU32::new(0);
        let result: Result<(), LocalError> =
            invoke_with_retry(&policy(5), &queue, &NoopObserver, "op", OperationMode::Normal, |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(InvocationFailure::sent(transport_error())) }
            })
            .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(result, Err(transport_error()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry() {
        let queue = RetryQueue::new();
        let result = invoke_with_retry(&policy(5), &queue, &NoopObserver, "op", OperationMode::Normal, |n| async move {
            if n == 0 {
                Err(InvocationFailure::sent(LocalError::ConnectionClosedByPeer))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_scheduled() {
        let queue = RetryQueue::new();
        let ticket = queue.schedule(Duration::from_secs(60)).unwrap();
        assert_eq!(queue.scheduled(), 1);

        let waiter = tokio::spawn(ticket.wait());
        tokio::task::yield_now().await;
        queue.destroy().await;

        assert!(matches!(
            waiter.await.unwrap(),
            Err(LocalError::RuntimeDestroyed)
        ));
        assert!(queue.is_destroyed());
        assert!(matches!(
            queue.schedule(Duration::ZERO),
            Err(LocalError::RuntimeDestroyed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_waits_for_running() {
        let queue = RetryQueue::new();
        let guard = queue
            .schedule(Duration::from_millis(10))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(queue.running(), 1);

        let q = queue.clone();
        let destroy = tokio::spawn(async move { q.destroy().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!destroy.is_finished());

        drop(guard);
        destroy.await.unwrap();
        assert_eq!(queue.running(), 0);
    }
}
