//! In-memory service publisher for tests

use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};

use crate::discovery::{DiscoveryError, ServicePublisher, ServiceRecord};

/// A call made against the publisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublisherCall {
    /// Record was published
    Publish(ServiceRecord),
    /// Full name was withdrawn
    Withdraw(String),
}

#[derive(Default)]
struct Inner {
    active: Vec<(String, ServiceRecord)>,
    history: Vec<PublisherCall>,
    failures_remaining: u32,
}

/// Publisher that records calls and can simulate an unavailable network
#[derive(Default)]
pub struct RecordingPublisher {
    inner: Mutex<Inner>,
}

impl RecordingPublisher {
    /// Publisher that always succeeds
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publisher whose next `count` publish calls fail
    #[must_use]
    pub fn failing(count: u32) -> Self {
        let publisher = Self::default();
        publisher.fail_next(count);
        publisher
    }

    /// Make the next `count` publish calls fail
    pub fn fail_next(&self, count: u32) {
        self.lock().failures_remaining = count;
    }

    /// Records currently published
    #[must_use]
    pub fn active(&self) -> Vec<ServiceRecord> {
        self.lock().active.iter().map(|(_, r)| r.clone()).collect()
    }

    /// Every call in order
    #[must_use]
    pub fn history(&self) -> Vec<PublisherCall> {
        self.lock().history.clone()
    }

    /// Number of successful publish calls
    #[must_use]
    pub fn publish_count(&self) -> usize {
        self.lock()
            .history
            .iter()
            .filter(|c| matches!(c, PublisherCall::Publish(_)))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ServicePublisher for RecordingPublisher {
    async fn publish(&self, record: &ServiceRecord) -> Result<String, DiscoveryError> {
        let mut inner = self.lock();
        if inner.failures_remaining > 0 {
            inner.failures_remaining -= 1;
            return Err(DiscoveryError::Publish("network unavailable".into()));
        }
        let fullname = format!("{}.{}", record.instance_name, record.service_type);
        inner.active.retain(|(name, _)| name != &fullname);
        inner.active.push((fullname.clone(), record.clone()));
        inner.history.push(PublisherCall::Publish(record.clone()));
        Ok(fullname)
    }

    async fn withdraw(&self, fullname: &str) -> Result<(), DiscoveryError> {
        let mut inner = self.lock();
        inner.active.retain(|(name, _)| name != fullname);
        inner
            .history
            .push(PublisherCall::Withdraw(fullname.to_string()));
        Ok(())
    }
}
