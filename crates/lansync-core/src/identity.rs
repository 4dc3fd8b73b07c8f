//! Device identity: wire fingerprint, display derivation, name rules.
//!
//! The raw 16 fingerprint bytes are the true wire identity. For display
//! and comparison in a UI they are rendered through a one-way 128-bit
//! derivation; equal raw bytes always produce equal displayed ids, and
//! the raw bytes cannot be reconstructed from the derived form.

use std::fmt;
use std::net::IpAddr;

use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::config::ProtocolConfig;
use crate::error::{Result, SyncError};

/// Length of a raw device fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 16;

/// 16 random bytes identifying a device for its lifetime.
///
/// Generated once and persisted by the embedding application; this
/// crate only consumes it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Generate a fresh random fingerprint.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub const fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// One-way display derivation of the raw identity.
    ///
    /// Both peers derive identically, so equal raw fingerprints render
    /// as equal ids on both screens.
    pub fn display_id(&self) -> Uuid {
        let hash = blake3::hash(&self.0);
        let mut derived = [0u8; 16];
        derived.copy_from_slice(&hash.as_bytes()[..16]);
        Uuid::from_bytes(derived)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_id())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Truncated raw prefix; enough to correlate logs on one device.
        write!(f, "Fingerprint({}…)", hex::encode(&self.0[..4]))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        // Only the derived form ever leaves the core.
        serializer.collect_str(&self.display_id())
    }
}

/// Platform tag carried in presence announcements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Desktop,
    Android,
    Ios,
    Unknown,
}

impl Platform {
    /// Platform of the running build.
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Platform::Android
        } else if cfg!(target_os = "ios") {
            Platform::Ios
        } else {
            Platform::Desktop
        }
    }

    pub fn wire_byte(&self) -> u8 {
        match self {
            Platform::Desktop => 1,
            Platform::Android => 2,
            Platform::Ios => 3,
            Platform::Unknown => 0,
        }
    }

    pub fn from_wire(byte: u8) -> Self {
        match byte {
            1 => Platform::Desktop,
            2 => Platform::Android,
            3 => Platform::Ios,
            _ => Platform::Unknown,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Platform::Desktop => "desktop",
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// User-visible device name, at most 16 UTF-8 bytes after sanitizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceName(String);

impl DeviceName {
    /// Sanitize a raw name: strip control characters and path
    /// separators, then truncate to the 16-byte limit on a character
    /// boundary. An empty result is a validation error.
    pub fn new(raw: &str) -> Result<Self> {
        let mut name = String::with_capacity(ProtocolConfig::MAX_NAME_LEN);
        for c in raw.chars() {
            if c.is_control() || c == '/' || c == '\\' {
                continue;
            }
            if name.len() + c.len_utf8() > ProtocolConfig::MAX_NAME_LEN {
                break;
            }
            name.push(c);
        }
        if name.is_empty() {
            return Err(SyncError::Validation {
                field: "device_name".to_string(),
                message: "name is empty after sanitizing".to_string(),
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a peer needs to introduce itself.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub fingerprint: Fingerprint,
    pub name: DeviceName,
    pub platform: Platform,
}

/// A discovered peer, keyed by fingerprint in the browse registry.
#[derive(Debug, Clone, Serialize)]
pub struct PeerRecord {
    pub fingerprint: Fingerprint,
    pub platform: Platform,
    pub name: DeviceName,
    pub addr: IpAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_id_is_deterministic() {
        let fp = Fingerprint::from_bytes([7u8; 16]);
        assert_eq!(fp.display_id(), Fingerprint::from_bytes([7u8; 16]).display_id());
    }

    #[test]
    fn test_display_id_differs_from_raw() {
        let raw = [7u8; 16];
        let fp = Fingerprint::from_bytes(raw);
        assert_ne!(fp.display_id().into_bytes(), raw);
    }

    #[test]
    fn test_generate_is_random() {
        assert_ne!(Fingerprint::generate().0, Fingerprint::generate().0);
    }

    #[test]
    fn test_platform_wire_roundtrip() {
        for p in [
            Platform::Desktop,
            Platform::Android,
            Platform::Ios,
            Platform::Unknown,
        ] {
            assert_eq!(Platform::from_wire(p.wire_byte()), p);
        }
        assert_eq!(Platform::from_wire(99), Platform::Unknown);
    }

    #[test]
    fn test_name_strips_control_and_path_chars() {
        let name = DeviceName::new("my\tdev/ice\\one\r\n").unwrap();
        assert_eq!(name.as_str(), "mydeviceone");
    }

    #[test]
    fn test_name_truncates_to_16_bytes_on_char_boundary() {
        let name = DeviceName::new("abcdefghijklmnopqrstuvwx").unwrap();
        assert_eq!(name.as_str().len(), 16);

        // Multi-byte characters never get split.
        let name = DeviceName::new("ééééééééé").unwrap();
        assert!(name.as_str().len() <= 16);
        assert!(name.as_str().chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(DeviceName::new("").is_err());
        assert!(DeviceName::new("///\r\n").is_err());
    }
}
