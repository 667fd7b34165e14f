//! Hardware address selection for the advertised identity

use rand::RngCore;
use std::fmt;
use std::str::FromStr;

/// Errors reading or parsing a MAC address
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MacError {
    /// Text was not six colon-separated hex octets
    #[error("invalid MAC format: {0}")]
    InvalidFormat(String),

    /// No usable interface address on this host
    #[error("failed to retrieve MAC address: {0}")]
    Unavailable(String),
}

/// A 48-bit IEEE 802 hardware address
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Wrap raw octets
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets
    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// A fresh random unicast, locally-administered address
    #[must_use]
    pub fn random_local() -> Self {
        let mut octets = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut octets);
        // Clear I/G (multicast) and set U/L (locally administered)
        octets[0] = (octets[0] & 0xFC) | 0x02;
        Self(octets)
    }

    /// The host's primary interface address
    ///
    /// Falls back to a pseudo-address derived from the machine id when
    /// no physical interface can be read.
    #[must_use]
    pub fn system() -> Self {
        match read_system_mac() {
            Ok(mac) => mac,
            Err(e) => {
                tracing::warn!(error = %e, "Falling back to machine-derived MAC");
                Self::stable_fallback()
            }
        }
    }

    /// Address derived from `/etc/machine-id` or the hostname
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        reason = "Hash extraction safely truncates to expected mac byte sizes"
    )]
    pub fn stable_fallback() -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let seed = std::fs::read_to_string("/etc/machine-id").unwrap_or_else(|_| {
            hostname::get().map_or_else(
                |_| "airplay-mirror".to_string(),
                |h| h.to_string_lossy().into_owned(),
            )
        });

        let mut hasher = DefaultHasher::new();
        seed.trim().hash(&mut hasher);
        let hash = hasher.finish();

        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = (hash >> (40 - 8 * i)) as u8;
        }
        octets[0] = (octets[0] & 0xFC) | 0x02;
        Self(octets)
    }

    /// Locally-administered bit is set
    #[must_use]
    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    /// Individual/group bit is clear
    #[must_use]
    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }

    /// Uppercase hex without separators, as used in RAOP instance names
    #[must_use]
    pub fn to_compact_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

impl FromStr for MacAddress {
    type Err = MacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(MacError::InvalidFormat(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(MacError::InvalidFormat(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| MacError::InvalidFormat(format!("invalid hex: {part}")))?;
        }

        Ok(Self(octets))
    }
}

#[cfg(target_os = "linux")]
fn read_system_mac() -> Result<MacAddress, MacError> {
    use std::fs;

    let net_dir = std::path::Path::new("/sys/class/net");
    let entries = fs::read_dir(net_dir).map_err(|e| MacError::Unavailable(e.to_string()))?;

    let mut names: Vec<_> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| !is_virtual_interface(name))
        .collect();
    // Deterministic choice across reboots
    names.sort();

    for name in names {
        let Ok(text) = fs::read_to_string(net_dir.join(&name).join("address")) else {
            continue;
        };
        let Ok(mac) = text.parse::<MacAddress>() else {
            continue;
        };
        if mac.octets() != [0u8; 6] && mac.is_unicast() {
            tracing::debug!(interface = %name, mac = %mac, "Using system MAC");
            return Ok(mac);
        }
    }

    Err(MacError::Unavailable("no suitable interface found".into()))
}

#[cfg(not(target_os = "linux"))]
fn read_system_mac() -> Result<MacAddress, MacError> {
    Err(MacError::Unavailable(
        "interface enumeration not supported on this platform".into(),
    ))
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn is_virtual_interface(name: &str) -> bool {
    const VIRTUAL_PREFIXES: &[&str] = &["veth", "docker", "br-", "virbr", "vmnet", "tun", "tap"];
    name == "lo" || VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_mac_is_local_unicast() {
        for _ in 0..64 {
            let mac = MacAddress::random_local();
            assert!(mac.is_locally_administered());
            assert!(mac.is_unicast());
        }
    }

    #[test]
    fn test_random_macs_differ() {
        assert_ne!(MacAddress::random_local(), MacAddress::random_local());
    }

    #[test]
    fn test_parse_and_display() {
        let mac: MacAddress = "58:55:ca:1a:e2:88".parse().unwrap();
        assert_eq!(mac.octets(), [0x58, 0x55, 0xca, 0x1a, 0xe2, 0x88]);
        assert_eq!(mac.to_string(), "58:55:CA:1A:E2:88");
        assert_eq!(mac.to_compact_hex(), "5855CA1AE288");
    }

    #[test]
    fn test_parse_invalid() {
        assert!("invalid".parse::<MacAddress>().is_err());
        assert!("58:55:ca:1a:e2".parse::<MacAddress>().is_err());
        assert!("58:55:ca:1a:e2:88:99".parse::<MacAddress>().is_err());
        assert!("58:55:ZZ:1a:e2:88".parse::<MacAddress>().is_err());
        assert!("585:5:ca:1a:e2:88".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_stable_fallback_is_stable() {
        let a = MacAddress::stable_fallback();
        let b = MacAddress::stable_fallback();
        assert_eq!(a, b);
        assert!(a.is_locally_administered());
        assert!(a.is_unicast());
    }

    #[test]
    fn test_virtual_interfaces_skipped() {
        assert!(is_virtual_interface("lo"));
        assert!(is_virtual_interface("docker0"));
        assert!(is_virtual_interface("veth12ab"));
        assert!(!is_virtual_interface("eth0"));
        assert!(!is_virtual_interface("wlp3s0"));
    }

    #[test]
    fn test_system_mac_is_unicast() {
        assert!(MacAddress::system().is_unicast());
    }
}
