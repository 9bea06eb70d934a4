//! Session-Expires header (RFC 4028): the session interval and which party
//! refreshes.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::param::{self, Param};

/// Entity responsible for session refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresher {
    Uac,
    Uas,
}

impl fmt::Display for Refresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refresher::Uac => write!(f, "uac"),
            Refresher::Uas => write!(f, "uas"),
        }
    }
}

/// Session-Expires header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExpires {
    /// Session interval in seconds
    pub delta_seconds: u32,
    /// Entity responsible for session refresh
    pub refresher: Option<Refresher>,
    /// Additional parameters
    pub params: Vec<Param>,
}

impl SessionExpires {
    pub fn new(delta_seconds: u32, refresher: Option<Refresher>) -> Self {
        SessionExpires {
            delta_seconds,
            refresher,
            params: Vec::new(),
        }
    }
}

impl fmt::Display for SessionExpires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.delta_seconds)?;
        if let Some(r) = self.refresher {
            write!(f, ";refresher={}", r)?;
        }
        write!(f, "{}", param::fmt_params(&self.params))
    }
}

impl FromStr for SessionExpires {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = param::split_quoted(s.trim(), ';');
        let delta = parts.remove(0).trim();
        let delta_seconds = delta
            .parse()
            .map_err(|_| Error::malformed("Session-Expires", 0))?;
        let mut se = SessionExpires::new(delta_seconds, None);
        if !parts.is_empty() {
            for p in param::parse_params(&s.trim()[delta.len() + 1..]) {
                if p.name.eq_ignore_ascii_case("refresher") {
                    se.refresher = match p.value.as_deref() {
                        Some("uac") => Some(Refresher::Uac),
                        Some("uas") => Some(Refresher::Uas),
                        _ => {
                            return Err(Error::malformed("Session-Expires", delta.len() + 1));
                        }
                    };
                } else {
                    se.params.push(p);
                }
            }
        }
        Ok(se)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for s in ["3600", "1800;refresher=uac", "90;refresher=uas;foo=bar"] {
            let se: SessionExpires = s.parse().unwrap();
            assert_eq!(se.to_string(), s);
        }
    }

    #[test]
    fn rejects_bad_refresher() {
        assert!("3600;refresher=nobody".parse::<SessionExpires>().is_err());
        assert!("abc".parse::<SessionExpires>().is_err());
    }
}
