use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::method::Method;

/// CSeq header value: sequence number plus method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        CSeq { seq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

impl FromStr for CSeq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let seq = parts
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| Error::malformed("CSeq", 0))?;
        let method = parts
            .next()
            .ok_or_else(|| Error::malformed("CSeq", s.len()))?
            .parse()?;
        if parts.next().is_some() {
            return Err(Error::malformed("CSeq", s.len()));
        }
        Ok(CSeq { seq, method })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cseq: CSeq = "314 REGISTER".parse().unwrap();
        assert_eq!(cseq.seq, 314);
        assert_eq!(cseq.method, Method::Register);
        assert_eq!(cseq.to_string(), "314 REGISTER");
    }

    #[test]
    fn rejects_trailing_junk() {
        assert!("1 INVITE x".parse::<CSeq>().is_err());
        assert!("INVITE".parse::<CSeq>().is_err());
    }
}
