use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::name_addr::NameAddr;
use crate::types::param::{self, Param};

/// A single Contact header entry.
///
/// `addr` is `None` for the wildcard `*` contact.  The `q` and `expires`
/// parameters are lifted out of the parameter list; everything else stays
/// in `params` with its received spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub addr: Option<NameAddr>,
    /// q-value scaled by 1000 (`q=0.5` is 500).
    pub q: Option<u16>,
    pub expires: Option<u32>,
    pub params: Vec<Param>,
}

impl Contact {
    pub fn new(addr: NameAddr) -> Self {
        Contact {
            addr: Some(addr),
            q: None,
            expires: None,
            params: Vec::new(),
        }
    }

    pub fn wildcard() -> Self {
        Contact {
            addr: None,
            q: None,
            expires: None,
            params: Vec::new(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.addr.is_none()
    }

    /// The `+sip.instance` parameter value with quotes stripped.
    pub fn instance_id(&self) -> Option<&str> {
        param::find_param(&self.params, "+sip.instance").and_then(|p| p.unquoted_value())
    }

    /// The `reg-id` parameter (RFC 5626 flow identifier).
    pub fn reg_id(&self) -> Option<&str> {
        param::find_param(&self.params, "reg-id").and_then(|p| p.unquoted_value())
    }

    /// An emergency registration carries the `sos` URI parameter on the
    /// contact URI.
    pub fn is_emergency(&self) -> bool {
        self.addr
            .as_ref()
            .map(|a| a.uri.has_param("sos"))
            .unwrap_or(false)
    }

    /// q-value with the default of 1000 (1.0) applied.
    pub fn q1000(&self) -> u16 {
        self.q.unwrap_or(1000)
    }

    /// Parse a Contact header value, which may hold several comma-separated
    /// entries or the wildcard.
    pub fn parse_list(value: &str) -> Result<Vec<Contact>> {
        if value.trim() == "*" {
            return Ok(vec![Contact::wildcard()]);
        }
        param::split_quoted(value, ',')
            .into_iter()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| v.parse())
            .collect()
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = match &self.addr {
            None => return write!(f, "*"),
            Some(addr) => addr,
        };
        write!(f, "{}", addr)?;
        if let Some(q) = self.q {
            // Render q back in decimal form.
            if q % 1000 == 0 {
                write!(f, ";q={}", q / 1000)?;
            } else {
                let s = format!("{:03}", q % 1000);
                write!(f, ";q={}.{}", q / 1000, s.trim_end_matches('0'))?;
            }
        }
        if let Some(expires) = self.expires {
            write!(f, ";expires={}", expires)?;
        }
        write!(f, "{}", param::fmt_params(&self.params))
    }
}

impl FromStr for Contact {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "*" {
            return Ok(Contact::wildcard());
        }
        let addr: NameAddr = s.parse()?;
        let mut contact = Contact::new(NameAddr {
            display_name: addr.display_name,
            uri: addr.uri,
            params: Vec::new(),
        });
        for p in addr.params {
            if p.name.eq_ignore_ascii_case("q") {
                let v = p
                    .value
                    .as_deref()
                    .ok_or_else(|| Error::malformed("Contact", 0))?;
                contact.q = Some(parse_qvalue(v).ok_or_else(|| Error::malformed("Contact", 0))?);
            } else if p.name.eq_ignore_ascii_case("expires") {
                let v = p
                    .value
                    .as_deref()
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| Error::malformed("Contact", 0))?;
                contact.expires = Some(v);
            } else {
                contact.params.push(p);
            }
        }
        Ok(contact)
    }
}

/// Parse a `0[.ddd]` / `1[.000]` q-value into thousandths.
fn parse_qvalue(s: &str) -> Option<u16> {
    let (int, frac) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    let int: u16 = int.parse().ok()?;
    if int > 1 || frac.len() > 3 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let mut frac_val = 0u16;
    for (i, c) in frac.chars().enumerate() {
        frac_val += (c as u16 - '0' as u16) * 10u16.pow(2 - i as u32);
    }
    let q = int * 1000 + frac_val;
    (q <= 1000).then_some(q)
}
