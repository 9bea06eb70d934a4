//! The HTTP client for the subscriber-profile store and the trait the SIP
//! layer consumes (so tests can substitute a fake).

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{HssError, Result};
use crate::ifc::Ifcs;
use crate::xml::{self, RegData};

/// Registration state asserted by the HSS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Registered,
    Unregistered,
    NotRegistered,
}

impl RegistrationState {
    fn from_wire(s: &str) -> Self {
        match s {
            "REGISTERED" => RegistrationState::Registered,
            "UNREGISTERED" => RegistrationState::Unregistered,
            _ => RegistrationState::NotRegistered,
        }
    }
}

/// Registration operation carried on `update_registration_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegOp {
    /// Assert (initial or refresh) registration.
    Register,
    /// The user de-registered.
    DeregUser,
    /// The node de-registered the user administratively.
    DeregAdmin,
}

impl RegOp {
    fn reqtype(&self) -> &'static str {
        match self {
            RegOp::Register => "reg",
            RegOp::DeregUser => "dereg-user",
            RegOp::DeregAdmin => "dereg-admin",
        }
    }
}

/// Result of a registration-state update: the asserted state plus the
/// subscription profile.
#[derive(Debug, Clone)]
pub struct RegistrationData {
    pub state: RegistrationState,
    /// iFCs keyed by each public identity they apply to.
    pub ifcs_by_public: HashMap<String, Ifcs>,
    /// All associated URIs, in profile order.  The first is the canonical
    /// AoR.
    pub uris: Vec<String>,
    pub ccfs: Vec<String>,
    pub ecfs: Vec<String>,
}

/// Result of a profile read for non-REGISTER transactions.
#[derive(Debug, Clone)]
pub struct SubscriberData {
    pub uris: Vec<String>,
    /// Public identities sharing the queried identity's service profile.
    pub aliases: Vec<String>,
    /// iFCs of the queried identity.
    pub ifcs: Ifcs,
    pub ccfs: Vec<String>,
    pub ecfs: Vec<String>,
    pub registered: bool,
}

/// The seam the SIP layer consumes.
#[async_trait]
pub trait HssProvider: Send + Sync {
    async fn update_registration_state(
        &self,
        public_id: &str,
        private_id: &str,
        op: RegOp,
        expires: u32,
    ) -> Result<RegistrationData>;

    async fn read(&self, public_id: &str) -> Result<SubscriberData>;
}

/// HTTP implementation against `/impu/<public>/reg-data`.
pub struct HssClient {
    http: reqwest::Client,
    base_url: String,
}

impl HssClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        HssClient {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn reg_data_url(&self, public_id: &str, private_id: Option<&str>) -> String {
        let mut url = format!("{}/impu/{}/reg-data", self.base_url, url_escape(public_id));
        if let Some(private_id) = private_id {
            if !private_id.is_empty() {
                url.push_str("?private_id=");
                url.push_str(&url_escape(private_id));
            }
        }
        url
    }

    async fn decode(&self, public_id: &str, rsp: reqwest::Response) -> Result<RegData> {
        let status = rsp.status().as_u16();
        if status == 404 {
            return Err(HssError::NotFound);
        }
        if !(200..300).contains(&status) {
            warn!(public_id, status, "HSS returned failure");
            return Err(HssError::Http(status));
        }
        let body = rsp.text().await?;
        xml::parse_reg_data(&body)
    }
}

#[async_trait]
impl HssProvider for HssClient {
    async fn update_registration_state(
        &self,
        public_id: &str,
        private_id: &str,
        op: RegOp,
        _expires: u32,
    ) -> Result<RegistrationData> {
        let url = self.reg_data_url(public_id, Some(private_id));
        let started = Instant::now();
        let rsp = self
            .http
            .put(&url)
            .json(&serde_json::json!({ "reqtype": op.reqtype() }))
            .send()
            .await?;
        let data = self.decode(public_id, rsp).await?;
        debug!(
            public_id,
            reqtype = op.reqtype(),
            latency_us = started.elapsed().as_micros() as u64,
            "HSS registration-state update"
        );
        Ok(build_registration_data(data))
    }

    async fn read(&self, public_id: &str) -> Result<SubscriberData> {
        let url = self.reg_data_url(public_id, None);
        let started = Instant::now();
        let rsp = self.http.get(&url).send().await?;
        let data = self.decode(public_id, rsp).await?;
        debug!(
            public_id,
            latency_us = started.elapsed().as_micros() as u64,
            "HSS profile read"
        );
        Ok(build_subscriber_data(public_id, data))
    }
}

fn build_registration_data(data: RegData) -> RegistrationData {
    let mut ifcs_by_public = HashMap::new();
    let mut uris = Vec::new();
    for profile in &data.profiles {
        for public in &profile.public_identities {
            uris.push(public.clone());
            ifcs_by_public.insert(public.clone(), profile.ifcs.clone());
        }
    }
    RegistrationData {
        state: RegistrationState::from_wire(&data.state),
        ifcs_by_public,
        uris,
        ccfs: data.ccfs,
        ecfs: data.ecfs,
    }
}

fn build_subscriber_data(public_id: &str, data: RegData) -> SubscriberData {
    let mut uris = Vec::new();
    let mut aliases = Vec::new();
    let mut ifcs = Ifcs::default();
    for profile in &data.profiles {
        for public in &profile.public_identities {
            uris.push(public.clone());
        }
        if profile.public_identities.iter().any(|p| p == public_id) {
            aliases = profile.public_identities.clone();
            ifcs = profile.ifcs.clone();
        }
    }
    SubscriberData {
        uris,
        aliases,
        ifcs,
        ccfs: data.ccfs,
        ecfs: data.ecfs,
        registered: data.state == "REGISTERED",
    }
}

/// Percent-encode a public identity for use as a URL path segment.
fn url_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn url_escaping_covers_sip_uris() {
        assert_eq!(
            url_escape("sip:alice@example.com"),
            "sip%3Aalice%40example.com"
        );
        assert_eq!(url_escape("tel:+1650"), "tel%3A%2B1650");
    }

    #[test]
    fn reg_data_url_shape() {
        let client = HssClient::new("http://hss.example.com:8888/");
        assert_eq!(
            client.reg_data_url("sip:alice@example.com", None),
            "http://hss.example.com:8888/impu/sip%3Aalice%40example.com/reg-data"
        );
        assert_eq!(
            client.reg_data_url("sip:a@b", Some("a@b")),
            "http://hss.example.com:8888/impu/sip%3Aa%40b/reg-data?private_id=a%40b"
        );
    }

    #[test]
    fn registration_data_flattens_profiles() {
        let doc = r#"<ClearwaterRegData>
            <RegistrationState>REGISTERED</RegistrationState>
            <IMSSubscription>
              <ServiceProfile>
                <PublicIdentity><Identity>sip:alice@example.com</Identity></PublicIdentity>
                <PublicIdentity><Identity>tel:+1650</Identity></PublicIdentity>
              </ServiceProfile>
            </IMSSubscription>
        </ClearwaterRegData>"#;
        let data = build_registration_data(xml::parse_reg_data(doc).unwrap());
        assert_eq!(data.state, RegistrationState::Registered);
        assert_eq!(data.uris, vec!["sip:alice@example.com", "tel:+1650"]);
        assert!(data.ifcs_by_public.contains_key("tel:+1650"));
    }

    #[test]
    fn subscriber_data_scopes_aliases_to_profile() {
        let doc = r#"<ClearwaterRegData>
            <RegistrationState>NOT_REGISTERED</RegistrationState>
            <IMSSubscription>
              <ServiceProfile>
                <PublicIdentity><Identity>sip:alice@example.com</Identity></PublicIdentity>
              </ServiceProfile>
              <ServiceProfile>
                <PublicIdentity><Identity>sip:bob@example.com</Identity></PublicIdentity>
              </ServiceProfile>
            </IMSSubscription>
        </ClearwaterRegData>"#;
        let data = build_subscriber_data("sip:bob@example.com", xml::parse_reg_data(doc).unwrap());
        assert_eq!(data.uris.len(), 2);
        assert_eq!(data.aliases, vec!["sip:bob@example.com"]);
        assert!(!data.registered);
    }
}
