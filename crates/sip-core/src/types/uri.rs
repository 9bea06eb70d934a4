use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::types::param::{self, Param};

/// URI scheme.  Only the schemes this node routes on are modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Sip,
    Sips,
    Tel,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Sip => write!(f, "sip"),
            Scheme::Sips => write!(f, "sips"),
            Scheme::Tel => write!(f, "tel"),
        }
    }
}

/// A SIP, SIPS or TEL URI.
///
/// For TEL URIs the subscriber digits are held in `user` and `host` is
/// empty.  Parameters keep their received spelling so a parsed URI prints
/// back to its input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<Param>,
}

impl Uri {
    /// Build a `sip:` URI with a user part.
    pub fn sip(user: &str, host: &str) -> Self {
        Uri {
            scheme: Scheme::Sip,
            user: Some(user.to_string()),
            host: host.to_string(),
            port: None,
            params: Vec::new(),
        }
    }

    /// Build a `sip:` URI with no user part.
    pub fn sip_host(host: &str) -> Self {
        Uri {
            scheme: Scheme::Sip,
            user: None,
            host: host.to_string(),
            port: None,
            params: Vec::new(),
        }
    }

    /// Build a `tel:` URI.
    pub fn tel(number: &str) -> Self {
        Uri {
            scheme: Scheme::Tel,
            user: Some(number.to_string()),
            host: String::new(),
            port: None,
            params: Vec::new(),
        }
    }

    pub fn is_sip(&self) -> bool {
        matches!(self.scheme, Scheme::Sip | Scheme::Sips)
    }

    pub fn is_tel(&self) -> bool {
        self.scheme == Scheme::Tel
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        param::find_param(&self.params, name)
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.param(name).is_some()
    }

    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        param::set_param(&mut self.params, name, value);
    }

    pub fn remove_param(&mut self, name: &str) -> bool {
        param::remove_param(&mut self.params, name)
    }

    /// Builder-style parameter insertion.
    pub fn with_param(mut self, name: &str, value: Option<&str>) -> Self {
        self.set_param(name, value);
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// The canonical public-id form: scheme, user and host with no
    /// parameters or port.  Used wherever a URI is compared as an identity.
    pub fn canonical(&self) -> String {
        match self.scheme {
            Scheme::Tel => format!("tel:{}", self.user.as_deref().unwrap_or("")),
            _ => match &self.user {
                Some(u) => format!("{}:{}@{}", self.scheme, u, self.host),
                None => format!("{}:{}", self.scheme, self.host),
            },
        }
    }

    fn parse_hostport(s: &str) -> Result<(String, Option<u16>)> {
        if let Some(rest) = s.strip_prefix('[') {
            // IPv6 reference
            let end = rest
                .find(']')
                .ok_or_else(|| Error::InvalidUri(s.to_string()))?;
            let host = format!("[{}]", &rest[..end]);
            let after = &rest[end + 1..];
            if let Some(p) = after.strip_prefix(':') {
                let port = p.parse().map_err(|_| Error::InvalidUri(s.to_string()))?;
                Ok((host, Some(port)))
            } else if after.is_empty() {
                Ok((host, None))
            } else {
                Err(Error::InvalidUri(s.to_string()))
            }
        } else {
            match s.rsplit_once(':') {
                Some((h, p)) if !h.is_empty() => {
                    let port = p.parse().map_err(|_| Error::InvalidUri(s.to_string()))?;
                    Ok((h.to_string(), Some(port)))
                }
                _ => Ok((s.to_string(), None)),
            }
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Tel => {
                write!(f, "tel:{}", self.user.as_deref().unwrap_or(""))?;
            }
            _ => {
                write!(f, "{}:", self.scheme)?;
                if let Some(user) = &self.user {
                    write!(f, "{}@", user)?;
                }
                write!(f, "{}", self.host)?;
                if let Some(port) = self.port {
                    write!(f, ":{}", port)?;
                }
            }
        }
        write!(f, "{}", param::fmt_params(&self.params))
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (scheme, rest) = match s.split_once(':') {
            Some(("sip", r)) => (Scheme::Sip, r),
            Some(("sips", r)) => (Scheme::Sips, r),
            Some(("tel", r)) => (Scheme::Tel, r),
            _ => return Err(Error::InvalidUri(s.to_string())),
        };

        // Split off the parameter tail (quote-aware, though URI parameter
        // values are rarely quoted).
        let mut parts = param::split_quoted(rest, ';');
        let head = parts.remove(0);
        let params = if parts.is_empty() {
            Vec::new()
        } else {
            param::parse_params(&rest[head.len() + 1..])
        };

        if scheme == Scheme::Tel {
            if head.is_empty() {
                return Err(Error::InvalidUri(s.to_string()));
            }
            return Ok(Uri {
                scheme,
                user: Some(head.to_string()),
                host: String::new(),
                port: None,
                params,
            });
        }

        let (user, hostport) = match head.rsplit_once('@') {
            Some((u, h)) => (Some(u.to_string()), h),
            None => (None, head),
        };
        if hostport.is_empty() {
            return Err(Error::InvalidUri(s.to_string()));
        }
        let (host, port) = Uri::parse_hostport(hostport)?;

        Ok(Uri {
            scheme,
            user,
            host,
            port,
            params,
        })
    }
}

// URIs serialize as their string form so stored records stay readable.
impl Serialize for Uri {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_full_sip_uri() {
        let uri: Uri = "sip:alice@example.com:5060;transport=TCP".parse().unwrap();
        assert_eq!(uri.scheme, Scheme::Sip);
        assert_eq!(uri.user(), Some("alice"));
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(5060));
        assert_eq!(uri.param("transport").unwrap().value.as_deref(), Some("TCP"));
    }

    #[test]
    fn print_parse_round_trip() {
        for s in [
            "sip:alice@example.com",
            "sip:example.com:5054;lr",
            "sip:odi_abc123@scscf.example.com:5054;lr;sescase=orig",
            "tel:+16505551234;npdi",
            "sip:alice@[2001:db8::1]:5060",
        ] {
            let uri: Uri = s.parse().unwrap();
            assert_eq!(uri.to_string(), s);
        }
    }

    #[test]
    fn canonical_strips_params_and_port() {
        let uri: Uri = "sip:alice@example.com:5060;transport=TCP".parse().unwrap();
        assert_eq!(uri.canonical(), "sip:alice@example.com");
        let tel: Uri = "tel:+1234;npdi".parse().unwrap();
        assert_eq!(tel.canonical(), "tel:+1234");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!("http://example.com".parse::<Uri>().is_err());
        assert!("sip:".parse::<Uri>().is_err());
    }
}
