use std::time::Duration;

/// How far down the signaling path this node record-routes itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRouteModel {
    Pcscf,
    PcscfIcscf,
    PcscfIcscfAs,
}

/// S-CSCF service configuration.
#[derive(Debug, Clone)]
pub struct ScscfConfig {
    /// Home domains this node serves.
    pub home_domains: Vec<String>,
    /// This node's own S-CSCF URI (the cluster URI).
    pub scscf_uri: String,
    /// Where requests for non-local served users go.
    pub icscf_uri: Option<String>,
    /// Where off-net and non-SIP requests break out.
    pub bgcf_uri: Option<String>,
    /// Session interval forced onto dialog-initiating INVITEs.
    pub session_expires: u32,
    /// How long an application server may sit on a request before the
    /// chain treats it as failed.
    pub as_liveness_timeout: Duration,
    pub record_route_model: RecordRouteModel,
    /// Operator identity placed in `orig-ioi`/`term-ioi`.
    pub ioi: String,
}

impl ScscfConfig {
    pub fn new(home_domain: impl Into<String>, scscf_uri: impl Into<String>) -> Self {
        let home_domain = home_domain.into();
        ScscfConfig {
            ioi: home_domain.clone(),
            home_domains: vec![home_domain],
            scscf_uri: scscf_uri.into(),
            icscf_uri: None,
            bgcf_uri: None,
            session_expires: 600,
            as_liveness_timeout: Duration::from_secs(4),
            record_route_model: RecordRouteModel::PcscfIcscf,
        }
    }

    pub fn is_home_domain(&self, host: &str) -> bool {
        self.home_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(host))
    }
}
