//! WhatsApp JID identity type.
//!
//! A JID is `user@server`, optionally carrying a device index
//! (`user:device@server`). Users live on `s.whatsapp.net`, groups on `g.us`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Server for 1-to-1 user chats.
pub const SERVER_USER: &str = "s.whatsapp.net";
/// Server for group chats.
pub const SERVER_GROUP: &str = "g.us";

/// A WhatsApp identity (`user@server`, optional device).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    pub user: String,
    pub server: String,
    pub device: Option<u16>,
}

impl Jid {
    /// Build a user JID (`user@s.whatsapp.net`).
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: SERVER_USER.to_string(),
            device: None,
        }
    }

    /// Build a group JID (`id@g.us`).
    pub fn group(id: impl Into<String>) -> Self {
        Self {
            user: id.into(),
            server: SERVER_GROUP.to_string(),
            device: None,
        }
    }

    pub fn is_user(&self) -> bool {
        self.server == SERVER_USER
    }

    pub fn is_group(&self) -> bool {
        self.server == SERVER_GROUP
    }

    /// Canonical `user@server` form, device index stripped.
    pub fn canonical(&self) -> String {
        format!("{}@{}", self.user, self.server)
    }
}

// Hashing uses the canonical text so a device-qualified JID lands in the same
// bucket as its bare form.
impl Hash for Jid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.user.hash(state);
        self.server.hash(state);
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device {
            Some(device) => write!(f, "{}:{}@{}", self.user, device, self.server),
            None => write!(f, "{}@{}", self.user, self.server),
        }
    }
}

impl FromStr for Jid {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (local, server) = s
            .split_once('@')
            .ok_or_else(|| BridgeError::InvalidArgument(format!("invalid jid '{s}': missing '@'")))?;
        if local.is_empty() || server.is_empty() {
            return Err(BridgeError::InvalidArgument(format!(
                "invalid jid '{s}': empty user or server"
            )));
        }

        let (user, device) = match local.split_once(':') {
            Some((user, device)) => {
                let device = device.parse::<u16>().map_err(|_| {
                    BridgeError::InvalidArgument(format!("invalid jid '{s}': bad device index"))
                })?;
                (user, Some(device))
            }
            None => (local, None),
        };

        Ok(Self {
            user: user.to_string(),
            server: server.to_string(),
            device,
        })
    }
}

impl TryFrom<String> for Jid {
    type Error = BridgeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    #[test]
    fn parse_user_jid() {
        let jid: Jid = "15551234567@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "15551234567");
        assert_eq!(jid.server, SERVER_USER);
        assert!(jid.is_user());
        assert!(!jid.is_group());
    }

    #[test]
    fn parse_group_jid() {
        let jid: Jid = "120363001234567890@g.us".parse().unwrap();
        assert!(jid.is_group());
        assert!(!jid.is_user());
    }

    #[test]
    fn parse_device_qualified() {
        let jid: Jid = "15551234567:3@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.device, Some(3));
        assert_eq!(jid.canonical(), "15551234567@s.whatsapp.net");
    }

    #[test]
    fn round_trip() {
        for raw in [
            "15551234567@s.whatsapp.net",
            "120363001234567890@g.us",
            "15551234567:12@s.whatsapp.net",
        ] {
            let jid: Jid = raw.parse().unwrap();
            let again: Jid = jid.to_string().parse().unwrap();
            assert_eq!(jid, again);
        }
    }

    #[test]
    fn malformed_inputs_fail() {
        for raw in ["", "no-separator", "@s.whatsapp.net", "user@", "a:b@c"] {
            assert!(raw.parse::<Jid>().is_err(), "expected failure for {raw:?}");
        }
    }

    #[test]
    fn hash_uses_canonical_text() {
        let bare: Jid = "1555@s.whatsapp.net".parse().unwrap();
        let device: Jid = "1555:7@s.whatsapp.net".parse().unwrap();

        let hash = |j: &Jid| {
            let mut h = DefaultHasher::new();
            j.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&bare), hash(&device));
        assert_ne!(bare, device);
    }

    #[test]
    fn serde_round_trip() {
        let jid = Jid::user("1555");
        let json = serde_json::to_string(&jid).unwrap();
        assert_eq!(json, "\"1555@s.whatsapp.net\"");
        let back: Jid = serde_json::from_str(&json).unwrap();
        assert_eq!(jid, back);
    }
}
