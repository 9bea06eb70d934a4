/// Registrar configuration, shared by the REGISTER and SUBSCRIBE handlers.
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// Home domains this registrar is authoritative for.
    pub home_domains: Vec<String>,
    /// Extra hostnames meaning "this node".
    pub local_aliases: Vec<String>,
    /// Upper bound on granted registration expiry, seconds.
    pub max_expires: u32,
    /// Default reg-event subscription lifetime, seconds.
    pub default_sub_expires: u32,
    /// The S-CSCF URI placed in Service-Route (gains the `orig` parameter).
    pub scscf_uri: String,
    /// Whether emergency registrations are accepted at all.
    pub allow_emergency: bool,
}

impl RegistrarConfig {
    pub fn new(home_domain: impl Into<String>, scscf_uri: impl Into<String>) -> Self {
        RegistrarConfig {
            home_domains: vec![home_domain.into()],
            local_aliases: Vec::new(),
            max_expires: 300,
            default_sub_expires: 300,
            scscf_uri: scscf_uri.into(),
            allow_emergency: true,
        }
    }

    pub fn is_home_domain(&self, host: &str) -> bool {
        self.home_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(host))
    }

    pub fn is_local_host(&self, host: &str) -> bool {
        self.is_home_domain(host)
            || self
                .local_aliases
                .iter()
                .any(|a| a.eq_ignore_ascii_case(host))
    }
}
