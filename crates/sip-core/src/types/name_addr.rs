use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::types::param::{self, Param};
use crate::types::uri::Uri;

/// A `name-addr` value: optional display name, a bracketed URI and header
/// parameters.  This is the shape of To/From, the routing headers and the
/// P- identity family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub params: Vec<Param>,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        NameAddr {
            display_name: None,
            uri,
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: Option<&str>) -> Self {
        param::set_param(&mut self.params, name, value);
        self
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

    /// The `tag` header parameter (To/From usage).
    pub fn tag(&self) -> Option<&str> {
        self.param("tag").and_then(|p| p.value.as_deref())
    }

    /// Parse a comma-separated list of name-addrs (quote and bracket aware).
    pub fn parse_list(value: &str) -> Result<Vec<NameAddr>> {
        param::split_quoted(value, ',')
            .into_iter()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| v.parse())
            .collect()
    }
}

impl fmt::Display for NameAddr {
    // Always print the bracketed form so URI parameters cannot be confused
    // with header parameters.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        write!(f, "{}", param::fmt_params(&self.params))
    }
}

impl FromStr for NameAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        // Bracketed form: [display-name] <uri> [;params]
        if let Some(open) = s.find('<') {
            let close = s
                .find('>')
                .ok_or_else(|| Error::malformed("name-addr", s.len()))?;
            if close < open {
                return Err(Error::malformed("name-addr", close));
            }
            let display = s[..open].trim();
            let display_name = if display.is_empty() {
                None
            } else {
                Some(display.trim_matches('"').to_string())
            };
            let uri: Uri = s[open + 1..close].parse()?;
            let tail = s[close + 1..].trim();
            let params = match tail.strip_prefix(';') {
                Some(rest) => param::parse_params(rest),
                None if tail.is_empty() => Vec::new(),
                None => return Err(Error::malformed("name-addr", close + 1)),
            };
            return Ok(NameAddr {
                display_name,
                uri,
                params,
            });
        }

        // Bare addr-spec: all parameters belong to the URI.
        Ok(NameAddr::new(s.parse()?))
    }
}

impl Serialize for NameAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NameAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
