use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
pub const GROUP_SERVER: &str = "g.us";
pub const LEGACY_USER_SERVER: &str = "c.us";
pub const BROADCAST_SERVER: &str = "broadcast";
pub const STATUS_BROADCAST_USER: &str = "status";

#[derive(Debug, Error)]
pub enum JidError {
    #[error("Invalid JID format: {0}")]
    InvalidFormat(String),
    #[error("Failed to parse component: {0}")]
    Parse(#[from] std::num::ParseIntError),
}

/// A WhatsApp participant/group identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    pub user: String,
    pub server: String,
    pub device: u16,
}

impl Jid {
    pub fn new(user: &str, server: &str) -> Self {
        Self {
            user: user.to_string(),
            server: server.to_string(),
            device: 0,
        }
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    pub fn is_broadcast(&self) -> bool {
        self.server == BROADCAST_SERVER
    }

    pub fn is_status_broadcast(&self) -> bool {
        self.server == BROADCAST_SERVER && self.user == STATUS_BROADCAST_USER
    }

    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }

    pub fn to_non_ad(&self) -> Self {
        Self {
            user: self.user.clone(),
            server: self.server.clone(),
            device: 0,
        }
    }

    /// Resolves a raw "number" as accepted by the send API into a canonical
    /// JID. Full JIDs (anything containing `@`) pass through parsing; bare
    /// numbers are stripped to digits, run through the country-specific
    /// mobile-number heuristics and suffixed with the default user server.
    pub fn canonicalize_number(number: &str) -> Result<Jid, JidError> {
        let trimmed = number.trim();
        if trimmed.is_empty() {
            return Err(JidError::InvalidFormat("empty number".to_string()));
        }
        if trimmed.contains('@') {
            let mut jid: Jid = trimmed.parse()?;
            // Old-style c.us user JIDs are aliases for s.whatsapp.net.
            if jid.server == LEGACY_USER_SERVER {
                jid.server = DEFAULT_USER_SERVER.to_string();
            }
            return Ok(jid);
        }

        let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err(JidError::InvalidFormat(number.to_string()));
        }
        let normalized = format_br_number(&format_mx_ar_number(&digits));
        Ok(Jid::new(&normalized, DEFAULT_USER_SERVER))
    }
}

/// Mexican (52) and Argentine (54) numbers carry an extra mobile digit after
/// the country code when dialed internationally; the wire identity omits it.
fn format_mx_ar_number(digits: &str) -> String {
    if (digits.starts_with("52") || digits.starts_with("54")) && digits.len() == 13 {
        let mut out = String::with_capacity(12);
        out.push_str(&digits[..2]);
        out.push_str(&digits[3..]);
        return out;
    }
    digits.to_string()
}

/// Brazilian (55) mobile numbers gained a ninth digit, but WhatsApp
/// identities for older area codes with low subscriber prefixes keep the
/// eight-digit form. Mirrors the numbering-plan rule: keep the long form
/// when the subscriber prefix is below 7 or the area code below 31.
fn format_br_number(digits: &str) -> String {
    if digits.len() != 13 || !digits.starts_with("55") {
        return digits.to_string();
    }
    let ddd: u32 = match digits[2..4].parse() {
        Ok(v) => v,
        Err(_) => return digits.to_string(),
    };
    let joker: u32 = match digits[5..6].parse() {
        Ok(v) => v,
        Err(_) => return digits.to_string(),
    };
    if joker < 7 || ddd < 31 {
        return digits.to_string();
    }
    let mut out = String::with_capacity(12);
    out.push_str(&digits[..4]);
    out.push_str(&digits[5..]);
    out
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user_part, server) = match s.split_once('@') {
            Some((u, srv)) => (u, srv.to_string()),
            None => ("", s.to_string()),
        };

        if user_part.is_empty() {
            return Ok(Jid::new("", &server));
        }

        let (user, device_str) = match user_part.rsplit_once(':') {
            Some((u, d)) => (u, Some(d)),
            None => (user_part, None),
        };

        let device = if let Some(d_str) = device_str {
            d_str.parse()?
        } else {
            0
        };

        Ok(Jid {
            user: user.to_string(),
            server,
            device,
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "{}", self.server)
        } else if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else {
            write!(f, "{}@{}", self.user, self.server)
        }
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

impl TryFrom<String> for Jid {
    type Error = JidError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Jid::from_str(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_roundtrip() {
        let jid: Jid = "5511999999999@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "5511999999999");
        assert_eq!(jid.server, DEFAULT_USER_SERVER);
        assert_eq!(jid.to_string(), "5511999999999@s.whatsapp.net");

        let device: Jid = "5511999999999:2@s.whatsapp.net".parse().unwrap();
        assert_eq!(device.device, 2);
        assert_eq!(device.to_non_ad().to_string(), "5511999999999@s.whatsapp.net");
    }

    #[test]
    fn group_and_broadcast_predicates() {
        let group: Jid = "123456789-987654@g.us".parse().unwrap();
        assert!(group.is_group());
        let status: Jid = "status@broadcast".parse().unwrap();
        assert!(status.is_broadcast());
        assert!(status.is_status_broadcast());
    }

    #[test]
    fn canonicalize_passthrough_jids() {
        let group = Jid::canonicalize_number("123456789-987654@g.us").unwrap();
        assert!(group.is_group());

        let legacy = Jid::canonicalize_number("5511988887777@c.us").unwrap();
        assert_eq!(legacy.server, DEFAULT_USER_SERVER);
    }

    #[test]
    fn canonicalize_br_numbers() {
        // Newer area code (DDD 31+) with high subscriber prefix drops the
        // ninth digit.
        let jid = Jid::canonicalize_number("5531988887777").unwrap();
        assert_eq!(jid.user, "553188887777");

        // Low area code keeps the nine-digit form.
        let jid = Jid::canonicalize_number("5511988887777").unwrap();
        assert_eq!(jid.user, "5511988887777");

        // Subscriber prefix below 7 keeps the nine-digit form.
        let jid = Jid::canonicalize_number("5531961234567").unwrap();
        assert_eq!(jid.user, "5531961234567");

        // Already twelve digits passes through.
        let jid = Jid::canonicalize_number("553188887777").unwrap();
        assert_eq!(jid.user, "553188887777");
    }

    #[test]
    fn canonicalize_mx_ar_numbers() {
        let jid = Jid::canonicalize_number("5215512345678").unwrap();
        assert_eq!(jid.user, "525512345678");

        let jid = Jid::canonicalize_number("5491112345678").unwrap();
        assert_eq!(jid.user, "541112345678");

        // Twelve-digit forms are left untouched.
        let jid = Jid::canonicalize_number("525512345678").unwrap();
        assert_eq!(jid.user, "525512345678");
    }

    #[test]
    fn canonicalize_strips_formatting() {
        let jid = Jid::canonicalize_number("+55 11 98888-7777").unwrap();
        assert_eq!(jid.user, "5511988887777");
        assert_eq!(jid.server, DEFAULT_USER_SERVER);
    }

    #[test]
    fn canonicalize_rejects_garbage() {
        assert!(Jid::canonicalize_number("").is_err());
        assert!(Jid::canonicalize_number("not-a-number").is_err());
    }
}
