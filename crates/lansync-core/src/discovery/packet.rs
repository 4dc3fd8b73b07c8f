//! Presence datagram encoding and validation.
//!
//! Layout: magic(16) + version(4) + code(1); a "present" packet (code 0)
//! continues with fingerprint(16) + platform(1) + nameLen−1(1) + name(n),
//! an "absent" packet (code 1) with fingerprint(16) only. The name
//! length is stored off by one, so a name is always 1..=256 bytes on the
//! wire (and 1..=16 under this implementation's name rules).

use crate::config::ProtocolConfig;
use crate::identity::{DeviceIdentity, DeviceName, Fingerprint, Platform};

const CODE_PRESENT: u8 = 0;
const CODE_ABSENT: u8 = 1;

/// A decoded presence datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Announcement {
    Present {
        fingerprint: Fingerprint,
        platform: Platform,
        name: DeviceName,
    },
    Absent {
        fingerprint: Fingerprint,
    },
}

impl Announcement {
    /// The "present" packet for this device.
    pub fn present(identity: &DeviceIdentity) -> Self {
        Announcement::Present {
            fingerprint: identity.fingerprint,
            platform: identity.platform,
            name: identity.name.clone(),
        }
    }

    /// The "absent" packet for this device.
    pub fn absent(identity: &DeviceIdentity) -> Self {
        Announcement::Absent {
            fingerprint: identity.fingerprint,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            Announcement::Present { fingerprint, .. } => fingerprint,
            Announcement::Absent { fingerprint } => fingerprint,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ProtocolConfig::MAX_DATAGRAM_LEN);
        buf.extend_from_slice(&ProtocolConfig::MAGIC);
        buf.extend_from_slice(&ProtocolConfig::VERSION);
        match self {
            Announcement::Present {
                fingerprint,
                platform,
                name,
            } => {
                buf.push(CODE_PRESENT);
                buf.extend_from_slice(fingerprint.as_bytes());
                buf.push(platform.wire_byte());
                let name_bytes = name.as_str().as_bytes();
                buf.push((name_bytes.len() - 1) as u8);
                buf.extend_from_slice(name_bytes);
            }
            Announcement::Absent { fingerprint } => {
                buf.push(CODE_ABSENT);
                buf.extend_from_slice(fingerprint.as_bytes());
            }
        }
        buf
    }

    /// Decode a received datagram. `None` for anything that is not a
    /// well-formed packet of ours (wrong magic/version, short, bad
    /// name); discovery silently ignores such traffic.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 21
            || buf[..16] != ProtocolConfig::MAGIC
            || buf[16..20] != ProtocolConfig::VERSION
        {
            return None;
        }
        match buf[20] {
            CODE_PRESENT => {
                if buf.len() < 40 {
                    return None;
                }
                let mut raw = [0u8; 16];
                raw.copy_from_slice(&buf[21..37]);
                let platform = Platform::from_wire(buf[37]);
                let name_len = buf[38] as usize + 1;
                let name_bytes = buf.get(39..39 + name_len)?;
                let name = DeviceName::new(std::str::from_utf8(name_bytes).ok()?).ok()?;
                Some(Announcement::Present {
                    fingerprint: Fingerprint::from_bytes(raw),
                    platform,
                    name,
                })
            }
            CODE_ABSENT => {
                if buf.len() < 37 {
                    return None;
                }
                let mut raw = [0u8; 16];
                raw.copy_from_slice(&buf[21..37]);
                Some(Announcement::Absent {
                    fingerprint: Fingerprint::from_bytes(raw),
                })
            }
            _ => None,
        }
    }
}
