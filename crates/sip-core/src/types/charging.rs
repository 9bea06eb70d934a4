//! IMS charging headers: P-Charging-Vector (RFC 7315) and
//! P-Charging-Function-Addresses.
//!
//! Both are parameter bags with a fixed printing order, so parse-then-print
//! is idempotent on well-formed input.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::param::{self, Param};

/// P-Charging-Vector header value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PChargingVector {
    pub icid_value: String,
    pub icid_generated_at: Option<String>,
    pub orig_ioi: Option<String>,
    pub term_ioi: Option<String>,
    pub transit_ioi: Vec<String>,
}

impl PChargingVector {
    pub fn new(icid_value: impl Into<String>) -> Self {
        PChargingVector {
            icid_value: icid_value.into(),
            ..Default::default()
        }
    }
}

impl fmt::Display for PChargingVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "icid-value={}", self.icid_value)?;
        if let Some(v) = &self.icid_generated_at {
            write!(f, ";icid-generated-at={}", v)?;
        }
        if let Some(v) = &self.orig_ioi {
            write!(f, ";orig-ioi={}", v)?;
        }
        if let Some(v) = &self.term_ioi {
            write!(f, ";term-ioi={}", v)?;
        }
        for v in &self.transit_ioi {
            write!(f, ";transit-ioi={}", v)?;
        }
        Ok(())
    }
}

impl FromStr for PChargingVector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let params = param::parse_params(s);
        let mut pcv = PChargingVector::default();
        for p in params {
            let value = p
                .value
                .clone()
                .ok_or_else(|| Error::malformed("P-Charging-Vector", 0))?;
            match p.name.to_ascii_lowercase().as_str() {
                "icid-value" => pcv.icid_value = value,
                "icid-generated-at" => pcv.icid_generated_at = Some(value),
                "orig-ioi" => pcv.orig_ioi = Some(value),
                "term-ioi" => pcv.term_ioi = Some(value),
                "transit-ioi" => pcv.transit_ioi.push(value),
                // Unknown parameters are not preserved; the node rewrites
                // this header at charging trigger points.
                _ => {}
            }
        }
        if pcv.icid_value.is_empty() {
            return Err(Error::malformed("P-Charging-Vector", 0));
        }
        Ok(pcv)
    }
}

/// P-Charging-Function-Addresses header value: repeatable `ccf` and `ecf`
/// parameters, priority order preserved.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PChargingFunctionAddresses {
    pub ccf: Vec<String>,
    pub ecf: Vec<String>,
}

impl PChargingFunctionAddresses {
    pub fn new(ccf: Vec<String>, ecf: Vec<String>) -> Self {
        PChargingFunctionAddresses { ccf, ecf }
    }

    pub fn is_empty(&self) -> bool {
        self.ccf.is_empty() && self.ecf.is_empty()
    }
}

impl fmt::Display for PChargingFunctionAddresses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut params: Vec<Param> = Vec::new();
        for v in &self.ccf {
            params.push(Param::new("ccf", Some(v.clone())));
        }
        for v in &self.ecf {
            params.push(Param::new("ecf", Some(v.clone())));
        }
        // fmt_params emits a leading ';' which this header does not carry
        // on its first parameter.
        let tail = param::fmt_params(&params);
        write!(f, "{}", tail.strip_prefix(';').unwrap_or(&tail))
    }
}

impl FromStr for PChargingFunctionAddresses {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut pcfa = PChargingFunctionAddresses::default();
        for p in param::parse_params(s) {
            let value = p
                .value
                .clone()
                .ok_or_else(|| Error::malformed("P-Charging-Function-Addresses", 0))?;
            match p.name.to_ascii_lowercase().as_str() {
                "ccf" => pcfa.ccf.push(value),
                "ecf" => pcfa.ecf.push(value),
                _ => {}
            }
        }
        if pcfa.is_empty() {
            return Err(Error::malformed("P-Charging-Function-Addresses", 0));
        }
        Ok(pcfa)
    }
}
