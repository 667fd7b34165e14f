//! mDNS advertisement of the receiver
//!
//! The receiver publishes an `_airplay._tcp` and an `_raop._tcp` record for
//! its current identity. Publication failures are retried in the background
//! with exponential backoff until they succeed or the service is stopped.

mod publisher;
pub mod txt;

#[cfg(test)]
mod tests;

pub use publisher::{MdnsPublisher, ServicePublisher};
pub use txt::{Advertisement, ServiceRecord};

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::types::BackoffConfig;

/// Errors from service advertisement
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// mDNS daemon error
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    /// Record cannot be represented in DNS-SD
    #[error("invalid service record: {0}")]
    InvalidRecord(String),

    /// Publisher-specific failure
    #[error("publish failed: {0}")]
    Publish(String),
}

impl DiscoveryError {
    /// Whether retrying later might succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidRecord(_))
    }
}

/// Current advertisement status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertisementState {
    /// Nothing published
    Withdrawn,
    /// Publication failed; retrying in the background
    Retrying {
        /// Failed attempts so far
        attempt: u32,
    },
    /// Records are on the network
    Published {
        /// `_airplay._tcp` instance name
        instance_name: String,
    },
}

/// Result of starting advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Published on the first attempt
    Published,
    /// First attempt failed; a background task keeps trying
    Retrying,
}

#[derive(Default)]
struct Shared {
    published: Mutex<Vec<String>>,
    state: RwLock<Option<AdvertisementState>>,
}

impl Shared {
    fn set_state(&self, state: AdvertisementState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(state);
    }

    fn state(&self) -> AdvertisementState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or(AdvertisementState::Withdrawn)
    }

    fn record_published(&self, names: Vec<String>, instance_name: String) {
        *self.published.lock().unwrap_or_else(PoisonError::into_inner) = names;
        self.set_state(AdvertisementState::Published { instance_name });
    }

    fn take_published(&self) -> Vec<String> {
        std::mem::take(&mut *self.published.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

struct RetryTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Publishes and withdraws the receiver's service records
pub struct DiscoveryService {
    publisher: Arc<dyn ServicePublisher>,
    backoff: BackoffConfig,
    shared: Arc<Shared>,
    retry: tokio::sync::Mutex<Option<RetryTask>>,
}

impl DiscoveryService {
    /// Create a service using the given publisher
    #[must_use]
    pub fn new(publisher: Arc<dyn ServicePublisher>, backoff: BackoffConfig) -> Self {
        Self {
            publisher,
            backoff,
            shared: Arc::new(Shared::default()),
            retry: tokio::sync::Mutex::new(None),
        }
    }

    /// Create a service publishing over mDNS
    #[must_use]
    pub fn mdns(backoff: BackoffConfig) -> Self {
        Self::new(Arc::new(MdnsPublisher::new()), backoff)
    }

    /// Current advertisement status
    #[must_use]
    pub fn state(&self) -> AdvertisementState {
        self.shared.state()
    }

    /// Whether the records are currently on the network
    #[must_use]
    pub fn is_advertising(&self) -> bool {
        matches!(self.state(), AdvertisementState::Published { .. })
    }

    /// Publish the advertisement, replacing any previous one
    ///
    /// # Errors
    ///
    /// Returns an error only for failures that retrying cannot fix; transient
    /// failures are retried in the background and reported as `Retrying`.
    pub async fn start(&self, advert: &Advertisement) -> Result<PublishOutcome, DiscoveryError> {
        self.stop().await;

        let records = advert.records();
        let instance_name = advert.identity.display_name.clone();

        match publish_all(self.publisher.as_ref(), &records).await {
            Ok(names) => {
                self.shared.record_published(names, instance_name);
                Ok(PublishOutcome::Published)
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "Advertisement failed, retrying in background");
                self.shared.set_state(AdvertisementState::Retrying { attempt: 1 });
                self.spawn_retry(records, instance_name).await;
                Ok(PublishOutcome::Retrying)
            }
            Err(e) => {
                self.shared.set_state(AdvertisementState::Withdrawn);
                Err(e)
            }
        }
    }

    /// Withdraw all records and cancel pending retries
    pub async fn stop(&self) {
        if let Some(task) = self.retry.lock().await.take() {
            task.cancel.cancel();
            let _ = task.handle.await;
        }

        for name in self.shared.take_published() {
            if let Err(e) = self.publisher.withdraw(&name).await {
                tracing::warn!(service = %name, error = %e, "Failed to withdraw service");
            }
        }
        self.shared.set_state(AdvertisementState::Withdrawn);
    }

    async fn spawn_retry(&self, records: [ServiceRecord; 2], instance_name: String) {
        let cancel = CancellationToken::new();
        let publisher = self.publisher.clone();
        let shared = self.shared.clone();
        let backoff = self.backoff;
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(backoff.delay(attempt)) => {}
                }

                match publish_all(publisher.as_ref(), &records).await {
                    Ok(names) => {
                        if token.is_cancelled() {
                            withdraw_all(publisher.as_ref(), &names).await;
                            return;
                        }
                        tracing::info!(name = %instance_name, attempt, "Advertisement published after retry");
                        shared.record_published(names, instance_name);
                        return;
                    }
                    Err(e) => {
                        attempt = attempt.saturating_add(1);
                        tracing::debug!(error = %e, attempt, "Advertisement retry failed");
                        shared.set_state(AdvertisementState::Retrying {
                            attempt: attempt.saturating_add(1),
                        });
                    }
                }
            }
        });

        *self.retry.lock().await = Some(RetryTask { cancel, handle });
    }
}

/// Publish every record or none of them
async fn publish_all(
    publisher: &dyn ServicePublisher,
    records: &[ServiceRecord],
) -> Result<Vec<String>, DiscoveryError> {
    let mut names = Vec::with_capacity(records.len());
    for record in records {
        match publisher.publish(record).await {
            Ok(name) => names.push(name),
            Err(e) => {
                withdraw_all(publisher, &names).await;
                return Err(e);
            }
        }
    }
    Ok(names)
}

async fn withdraw_all(publisher: &dyn ServicePublisher, names: &[String]) {
    for name in names {
        let _ = publisher.withdraw(name).await;
    }
}
