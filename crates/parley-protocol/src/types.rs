use std::fmt;

use serde::{Deserialize, Serialize};

/// Channel identifier. `-1` on the wire means "no channel" (leave).
pub type ChannelId = i64;

/// Server (guild) identifier.
pub type ServerId = i64;

/// Message identifier allocated by the storage layer.
pub type MessageId = i64;

/// Globally unique user identity: a display name plus a 4-digit tag,
/// rendered as `display#NNNN`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
    pub fn new(display: &str, tag: u16) -> Self {
        Self(format!("{display}#{tag:04}"))
    }

    pub fn from_full(full: impl Into<String>) -> Self {
        Self(full.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The display half, without the `#NNNN` tag.
    pub fn display(&self) -> &str {
        match self.0.rfind('#') {
            Some(pos) => &self.0[..pos],
            None => &self.0,
        }
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-server permission bits granted to a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermBits(pub u32);

impl PermBits {
    pub const NONE: PermBits = PermBits(0);
    pub const DELETE_MESSAGES: PermBits = PermBits(1 << 0);
    pub const PIN_MESSAGES: PermBits = PermBits(1 << 1);
    pub const KICK_USERS: PermBits = PermBits(1 << 2);
    pub const ADMIN: PermBits = PermBits(1 << 3);

    pub fn contains(self, other: PermBits) -> bool {
        self.0 & other.0 == other.0 || self.0 & Self::ADMIN.0 != 0
    }
}

impl std::ops::BitOr for PermBits {
    type Output = PermBits;
    fn bitor(self, rhs: PermBits) -> PermBits {
        PermBits(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_rendering() {
        let u = Username::new("alice", 1);
        assert_eq!(u.as_str(), "alice#0001");
        assert_eq!(u.display(), "alice");
    }

    #[test]
    fn username_display_without_tag() {
        let u = Username::from_full("legacy");
        assert_eq!(u.display(), "legacy");
    }

    #[test]
    fn username_serde_is_transparent() {
        let u = Username::new("bob", 42);
        let json = serde_json::to_string(&u).unwrap();
        assert_eq!(json, "\"bob#0042\"");
        let back: Username = serde_json::from_str(&json).unwrap();
        assert_eq!(back, u);
    }

    #[test]
    fn perm_bits_admin_implies_all() {
        let p = PermBits::ADMIN;
        assert!(p.contains(PermBits::DELETE_MESSAGES));
        assert!(p.contains(PermBits::PIN_MESSAGES));
    }

    #[test]
    fn perm_bits_plain_membership() {
        let p = PermBits::DELETE_MESSAGES | PermBits::PIN_MESSAGES;
        assert!(p.contains(PermBits::DELETE_MESSAGES));
        assert!(!p.contains(PermBits::KICK_USERS));
    }
}
