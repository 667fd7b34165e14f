//! Publishing backends for service records

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::DiscoveryError;
use super::txt::ServiceRecord;

/// Something that can put a service record on the network
#[async_trait]
pub trait ServicePublisher: Send + Sync {
    /// Register a record, returning the full service name used to withdraw it
    async fn publish(&self, record: &ServiceRecord) -> Result<String, DiscoveryError>;

    /// Withdraw a previously published record
    async fn withdraw(&self, fullname: &str) -> Result<(), DiscoveryError>;
}

/// mDNS publisher backed by `mdns-sd`
///
/// The daemon is created lazily so a missing network at startup is a
/// retryable publication failure instead of a construction error.
pub struct MdnsPublisher {
    daemon: Mutex<Option<ServiceDaemon>>,
    host_name: String,
}

impl MdnsPublisher {
    /// Create a publisher using the system hostname
    #[must_use]
    pub fn new() -> Self {
        let raw = hostname::get().map_or_else(
            |_| "airplay-mirror".to_string(),
            |h| h.to_string_lossy().into_owned(),
        );
        Self::with_host_name(&raw)
    }

    /// Create a publisher answering for `host`
    #[must_use]
    pub fn with_host_name(host: &str) -> Self {
        Self {
            daemon: Mutex::new(None),
            host_name: sanitize_host_label(host),
        }
    }

    /// Host name used in SRV records, e.g. `studio.local.`
    #[must_use]
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    fn daemon(&self) -> Result<ServiceDaemon, DiscoveryError> {
        let mut guard = self.daemon.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(daemon) = guard.as_ref() {
            return Ok(daemon.clone());
        }
        let daemon = ServiceDaemon::new()?;
        *guard = Some(daemon.clone());
        Ok(daemon)
    }

    fn reset_daemon(&self) {
        let daemon = self
            .daemon
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(daemon) = daemon {
            let _ = daemon.shutdown();
        }
    }
}

impl Default for MdnsPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MdnsPublisher {
    fn drop(&mut self) {
        self.reset_daemon();
    }
}

#[async_trait]
impl ServicePublisher for MdnsPublisher {
    async fn publish(&self, record: &ServiceRecord) -> Result<String, DiscoveryError> {
        let properties: HashMap<String, String> = record
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let info = ServiceInfo::new(
            &record.service_type,
            &record.instance_name,
            &self.host_name,
            "",
            record.port,
            properties,
        )
        .map_err(|e| DiscoveryError::InvalidRecord(e.to_string()))?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        let daemon = self.daemon()?;
        if let Err(e) = daemon.register(info) {
            // A daemon whose sockets died with the interface is useless; rebuild next time
            self.reset_daemon();
            return Err(e.into());
        }

        tracing::info!(
            service = %fullname,
            port = record.port,
            "mDNS service registered"
        );
        Ok(fullname)
    }

    async fn withdraw(&self, fullname: &str) -> Result<(), DiscoveryError> {
        let daemon = self.daemon()?;
        daemon.unregister(fullname)?;
        tracing::info!(service = %fullname, "mDNS service unregistered");
        Ok(())
    }
}

fn sanitize_host_label(host: &str) -> String {
    let label: String = host
        .split('.')
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let label = label.trim_matches('-');
    if label.is_empty() {
        "airplay-mirror.local.".to_string()
    } else {
        format!("{label}.local.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_label_sanitized() {
        assert_eq!(sanitize_host_label("studio"), "studio.local.");
        assert_eq!(sanitize_host_label("my box.lan"), "my-box.local.");
        assert_eq!(sanitize_host_label("..."), "airplay-mirror.local.");
        assert_eq!(sanitize_host_label("_x_"), "x.local.");
    }
}
