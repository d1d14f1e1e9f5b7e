//! WhatsApp JID parsing and direct-delivery eligibility.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::channel::ChannelError;

/// Server suffix for regular user accounts.
pub const USER_SERVER: &str = "s.whatsapp.net";

/// Address class, derived from the JID server part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JidKind {
    /// A person (`s.whatsapp.net`, legacy `c.us`).
    User,
    /// A hidden-number identity (`lid`).
    Lid,
    /// A group chat (`g.us`).
    Group,
    /// A broadcast list or status (`broadcast`).
    Broadcast,
    /// A channel/newsletter (`newsletter`).
    Newsletter,
}

impl JidKind {
    /// Whether one-to-one sends to this class are allowed.
    pub fn is_direct(self) -> bool {
        matches!(self, Self::User | Self::Lid)
    }

    fn from_server(server: &str) -> Option<Self> {
        match server {
            USER_SERVER | "c.us" => Some(Self::User),
            "lid" => Some(Self::Lid),
            "g.us" => Some(Self::Group),
            "broadcast" => Some(Self::Broadcast),
            "newsletter" => Some(Self::Newsletter),
            _ => None,
        }
    }
}

/// A parsed WhatsApp address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Jid {
    user: String,
    server: String,
    kind: JidKind,
}

static PHONE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9]{6,20}$").ok());

// Device suffixes (`:12`) and agent suffixes (`_1`) are allowed.
static USER_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Za-z.\-]+(?:_[0-9]+)?(?::[0-9]+)?$").ok());

fn pattern_matches(pattern: &LazyLock<Option<Regex>>, value: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(value))
}

impl Jid {
    /// Parse `user@server` or a bare phone number.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidRecipient`] when the address is malformed.
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        let trimmed = raw.trim();
        let invalid = |reason: &str| ChannelError::InvalidRecipient {
            recipient: raw.to_owned(),
            reason: reason.to_owned(),
        };

        let Some((user, server)) = trimmed.split_once('@') else {
            if pattern_matches(&PHONE_PATTERN, trimmed) {
                return Ok(Self {
                    user: trimmed.trim_start_matches('+').to_owned(),
                    server: USER_SERVER.to_owned(),
                    kind: JidKind::User,
                });
            }
            return Err(invalid("not a phone number or JID"));
        };

        let kind = JidKind::from_server(server).ok_or_else(|| invalid("unknown JID server"))?;
        if user.is_empty() || !pattern_matches(&USER_PATTERN, user) {
            return Err(invalid("malformed JID user part"));
        }

        Ok(Self {
            user: user.to_owned(),
            server: server.to_owned(),
            kind,
        })
    }

    /// Parse and require a direct-deliverable address.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidRecipient`] for malformed addresses and
    /// for groups, broadcasts and newsletters.
    pub fn parse_direct(raw: &str) -> Result<Self, ChannelError> {
        let jid = Self::parse(raw)?;
        if !jid.kind.is_direct() {
            return Err(ChannelError::InvalidRecipient {
                recipient: raw.to_owned(),
                reason: format!("{:?} targets cannot receive direct messages", jid.kind),
            });
        }
        Ok(jid)
    }

    /// User part without device suffix (the phone number for regular users).
    pub fn user(&self) -> &str {
        let base = self.user.split(':').next().unwrap_or(&self.user);
        base.split('_').next().unwrap_or(base)
    }

    /// Server part.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Address class.
    pub fn kind(&self) -> JidKind {
        self.kind
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.server)
    }
}
