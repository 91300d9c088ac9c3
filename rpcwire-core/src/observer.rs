//! Observability hooks.

use crate::connection::ConnectionState;
use crate::error::LocalError;
use crate::info::ConnectionInfo;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives runtime events. Every method has an empty default.
pub trait Observer: Send + Sync {
    fn state_changed(&self, _info: &ConnectionInfo, _from: ConnectionState, _to: ConnectionState) {}

    fn message_sent(&self, _info: &ConnectionInfo, _size: usize) {}

    fn message_received(&self, _info: &ConnectionInfo, _size: usize) {}

    fn invocation_retried(&self, _operation: &str, _retry: u32, _error: &LocalError) {}

    fn invocation_failed(&self, _operation: &str, _error: &LocalError) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Runtime statistics.
#[derive(Debug, Default)]
pub struct StatsObserver {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub retries_total: AtomicU64,
    pub failures_total: AtomicU64,
}

impl Observer for StatsObserver {
    fn state_changed(&self, _info: &ConnectionInfo, from: ConnectionState, to: ConnectionState) {
        if from == ConnectionState::Validating && to == ConnectionState::Active {
            self.connections_total.fetch_add(1, Ordering::Relaxed);
            self.connections_active.fetch_add(1, Ordering::Relaxed);
        } else if to == ConnectionState::Closed && from != ConnectionState::Validating {
            self.connections_active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn message_sent(&self, _info: &ConnectionInfo, size: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
    }

    fn message_received(&self, _info: &ConnectionInfo, size: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
    }

    fn invocation_retried(&self, _operation: &str, _retry: u32, _error: &LocalError) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    fn invocation_failed(&self, _operation: &str, _error: &LocalError) {
        self.failures_total.fetch_add(1, Ordering::Relaxed);
    }
}
