//! The S-CSCF sproutlet: per-transaction service logic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use scscf_as_chain::{AsChainLink, AsChainTable, SessionCase, Trigger, ODI_PREFIX};
use scscf_hss_client::{DefaultHandling, HssError, HssProvider, SubscriberData};
use scscf_reg_store::{ContactEvent, RegStore, SetOutcome};
use scscf_sip_core::prelude::*;
use scscf_sproutlet_core::{Sproutlet, SproutletTsx, TimerId, TsxHelper};

use crate::config::{RecordRouteModel, ScscfConfig};
use crate::enum_service::EnumService;

/// Which kind of next hop a dialog-initiating request is about to take;
/// the record-route model decides which of these keep the node in the
/// dialog path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteHop {
    /// An application server named by an iFC.
    AppServer,
    /// The I-CSCF, for served users this node does not own.
    Icscf,
    /// Everything facing the access or breakout edge: registered
    /// contacts, the terminating-side loopback, the BGCF, off-net SIP.
    Edge,
}

/// The S-CSCF service registered with the proxy.
pub struct ScscfSproutlet {
    config: ScscfConfig,
    store: Arc<RegStore>,
    hss: Arc<dyn HssProvider>,
    enum_service: Arc<dyn EnumService>,
    chain_table: Arc<AsChainTable>,
}

impl ScscfSproutlet {
    pub fn new(
        config: ScscfConfig,
        store: Arc<RegStore>,
        hss: Arc<dyn HssProvider>,
        enum_service: Arc<dyn EnumService>,
        chain_table: Arc<AsChainTable>,
    ) -> Self {
        ScscfSproutlet {
            config,
            store,
            hss,
            enum_service,
            chain_table,
        }
    }

    pub fn chain_table(&self) -> &Arc<AsChainTable> {
        &self.chain_table
    }
}

impl Sproutlet for ScscfSproutlet {
    fn service_name(&self) -> &str {
        "scscf"
    }

    fn aliases(&self) -> Vec<String> {
        self.config
            .scscf_uri
            .parse::<Uri>()
            .map(|u| vec![u.host])
            .unwrap_or_default()
    }

    fn get_tsx(&self, _alias: &str, req: &Request) -> Option<Box<dyn SproutletTsx>> {
        // REGISTER belongs to the registrar service.
        if req.method == Method::Register {
            return None;
        }
        Some(Box::new(ScscfTsx {
            config: self.config.clone(),
            store: self.store.clone(),
            hss: self.hss.clone(),
            enum_service: self.enum_service.clone(),
            chain_table: self.chain_table.clone(),
            session_case: SessionCase::Terminating,
            as_chain_link: None,
            hss_cache: HashMap::new(),
            base_req: None,
            target_aor: None,
            target_bindings: HashMap::new(),
            as_fork: None,
            liveness_timer: None,
            current_default_handling: None,
        }))
    }
}

struct ScscfTsx {
    config: ScscfConfig,
    store: Arc<RegStore>,
    hss: Arc<dyn HssProvider>,
    enum_service: Arc<dyn EnumService>,
    chain_table: Arc<AsChainTable>,

    session_case: SessionCase,
    as_chain_link: Option<AsChainLink>,
    /// Per-transaction subscriber-data cache, keyed by public identity.
    hss_cache: HashMap<String, SubscriberData>,
    /// The request as received (service routes stripped), used to resume
    /// the chain when a server is skipped.
    base_req: Option<Request>,
    /// Set when the request was forked to registered contacts.
    target_aor: Option<String>,
    target_bindings: HashMap<u32, String>,
    /// The fork currently parked at an application server.
    as_fork: Option<u32>,
    liveness_timer: Option<TimerId>,
    current_default_handling: Option<DefaultHandling>,
}

#[async_trait]
impl SproutletTsx for ScscfTsx {
    async fn on_rx_initial_request(&mut self, helper: &mut TsxHelper, mut req: Request) {
        // Resolve session case and AS chain, either fresh or by resuming
        // through an ODI token minted on an earlier hop.
        let odi_token = helper
            .dispatched_route()
            .and_then(|r| r.uri.user())
            .filter(|u| u.starts_with(ODI_PREFIX))
            .map(str::to_string);

        if let Some(token) = odi_token {
            match self.chain_table.lookup(&token) {
                Some(link) => {
                    debug!(token, position = link.position(), "resuming AS chain");
                    self.session_case = link.session_case();
                    let link = self.check_retarget(link, &req).await;
                    self.session_case = link.session_case();
                    self.as_chain_link = Some(link);
                }
                None => {
                    info!(token, "unknown or expired ODI token");
                    helper.reject(StatusCode::NOT_FOUND, None);
                    return;
                }
            }
        } else {
            let originating = helper
                .dispatched_route()
                .map(|r| r.uri.has_param("orig"))
                .unwrap_or(false);
            self.session_case = if originating {
                SessionCase::Originating
            } else {
                SessionCase::Terminating
            };

            let served_user = self.served_user_from_msg(&req);
            match served_user {
                Some(served_user) if self.is_served_user_local(&served_user) => {
                    match self.subscriber_data(&served_user).await {
                        Ok(data) => {
                            let link = self.chain_table.create_chain(
                                self.session_case,
                                served_user,
                                data.ifcs.clone(),
                                data.registered,
                                helper.trail(),
                            );
                            self.as_chain_link = Some(link);
                        }
                        Err(HssError::NotFound) => {
                            if self.session_case.is_terminating() {
                                helper.reject(StatusCode::NOT_FOUND, None);
                                return;
                            }
                            debug!(served_user, "unknown originating served user; no services");
                        }
                        Err(e) => {
                            warn!(error = %e, "subscriber data fetch failed");
                            helper.reject(StatusCode::SERVER_TIMEOUT, None);
                            return;
                        }
                    }
                }
                _ => {
                    debug!("no local served user; applying no services");
                }
            }
        }

        self.prepare_initial_request(&mut req);

        self.base_req = Some(req.clone());
        self.apply_services(helper, req).await;
    }

    async fn on_rx_in_dialog_request(&mut self, helper: &mut TsxHelper, req: Request) {
        // The billing role travels in the dialog id recorded at session
        // set-up.
        if let Some(role) = helper.dialog_id() {
            debug!(billing_role = role, "in-dialog request");
        }
        helper.send_request(req);
    }

    async fn on_rx_response(&mut self, helper: &mut TsxHelper, rsp: Response, fork_id: u32) {
        if self.as_fork == Some(fork_id) {
            self.on_as_response(helper, rsp).await;
            return;
        }

        // A 430 from a registered contact means the flow behind that
        // binding is dead: remove the binding, let aggregation pick any
        // surviving fork.
        if rsp.status == StatusCode::FLOW_FAILED {
            if let (Some(aor), Some(binding_id)) =
                (self.target_aor.clone(), self.target_bindings.get(&fork_id))
            {
                let binding_id = binding_id.clone();
                info!(aor, binding = binding_id, "flow failed; removing binding");
                self.remove_binding(&aor, &binding_id).await;
            }
        }

        helper.send_response(rsp);
    }

    async fn on_timer_expiry(&mut self, helper: &mut TsxHelper, context: u64) {
        // The liveness timer carries the guarded fork id as its context.
        let fork_id = context as u32;
        if self.as_fork != Some(fork_id) {
            return;
        }
        info!(fork_id, "application server liveness timeout");
        self.as_fork = None;
        self.liveness_timer = None;
        helper.cancel_fork(fork_id);

        match self
            .current_default_handling
            .unwrap_or(DefaultHandling::SessionContinued)
        {
            DefaultHandling::SessionContinued => {
                if let Some(base) = self.base_req.clone() {
                    self.apply_services(helper, base).await;
                }
            }
            DefaultHandling::SessionTerminated => {
                helper.reject(StatusCode::REQUEST_TIMEOUT, None);
            }
        }
    }
}

impl ScscfTsx {
    /// Header surgery every initial request gets on arrival.
    fn prepare_initial_request(&self, req: &mut Request) {
        // Session refresh discipline on INVITEs.
        if req.method == Method::Invite && req.session_expires().is_none() {
            req.headers.push(
                HeaderName::SessionExpires,
                SessionExpires::new(self.config.session_expires, None).to_string(),
            );
        }

        // Charging correlation: every initial request carries an icid.
        let pcv = req
            .headers
            .first(&HeaderName::PChargingVector)
            .and_then(|v| v.parse::<PChargingVector>().ok());
        let mut pcv = match pcv {
            Some(pcv) => pcv,
            None => {
                let mut fresh = PChargingVector::new(Uuid::new_v4().simple().to_string());
                fresh.icid_generated_at = self
                    .config
                    .scscf_uri
                    .parse::<Uri>()
                    .ok()
                    .map(|u| u.host);
                fresh
            }
        };
        if self.session_case.is_originating() && pcv.orig_ioi.is_none() {
            pcv.orig_ioi = Some(self.config.ioi.clone());
        } else if self.session_case.is_terminating() && pcv.term_ioi.is_none() {
            pcv.term_ioi = Some(self.config.ioi.clone());
        }
        req.headers
            .set(HeaderName::PChargingVector, pcv.to_string());
    }

    /// Derive the served user for the current hop.
    fn served_user_from_msg(&self, req: &Request) -> Option<String> {
        if self.session_case.is_originating() {
            req.p_served_user()
                .map(|na| na.uri.canonical())
                .or_else(|| {
                    req.p_asserted_identity()
                        .ok()
                        .and_then(|l| l.into_iter().next())
                        .map(|na| na.uri.canonical())
                })
                .or_else(|| req.from().map(|f| f.uri.canonical()))
        } else {
            Some(req.uri.canonical())
        }
    }

    fn is_served_user_local(&self, served_user: &str) -> bool {
        match served_user.parse::<Uri>() {
            Ok(uri) if uri.is_sip() => self.config.is_home_domain(&uri.host),
            Ok(uri) => uri.is_tel(),
            Err(_) => false,
        }
    }

    /// An AS on the terminating side may have retargeted the request.  A
    /// new Request-URI means the original served user diverted the call:
    /// their originating-cdiv services now apply.
    async fn check_retarget(&mut self, link: AsChainLink, req: &Request) -> AsChainLink {
        if !link.session_case().is_terminating() {
            return link;
        }
        let target = req.uri.canonical();
        if target == link.served_user() {
            return link;
        }
        info!(
            diverting_user = link.served_user(),
            new_target = target,
            "terminating request retargeted; switching to originating-cdiv"
        );
        let served_user = link.served_user().to_string();
        match self.subscriber_data(&served_user).await {
            Ok(data) => self.chain_table.create_chain(
                SessionCase::OriginatingCdiv,
                served_user,
                data.ifcs.clone(),
                data.registered,
                link.chain().trail(),
            ),
            Err(e) => {
                warn!(error = %e, "retarget profile fetch failed; continuing original chain");
                link
            }
        }
    }

    async fn subscriber_data(&mut self, public_id: &str) -> std::result::Result<SubscriberData, HssError> {
        if let Some(data) = self.hss_cache.get(public_id) {
            return Ok(data.clone());
        }
        let data = self.hss.read(public_id).await?;
        self.hss_cache.insert(public_id.to_string(), data.clone());
        Ok(data)
    }

    /// Keep this node in the dialog path for a dialog-initiating request,
    /// if the record-route model covers this kind of hop.  The billing
    /// role rides in the Record-Route's dialog parameter.
    fn request_record_route(&self, helper: &mut TsxHelper, req: &Request, hop: RouteHop) {
        if !req.method.is_dialog_initiating() {
            return;
        }
        let wanted = match hop {
            RouteHop::AppServer => {
                self.config.record_route_model == RecordRouteModel::PcscfIcscfAs
            }
            RouteHop::Icscf => self.config.record_route_model != RecordRouteModel::Pcscf,
            RouteHop::Edge => true,
        };
        if !wanted {
            return;
        }
        let billing_role = if self.session_case.is_originating() {
            "charge-orig"
        } else {
            "charge-term"
        };
        helper.add_to_dialog(Some(billing_role.to_string()));
    }

    /// Walk the chain: route to the next matching server, or on to the
    /// final target.
    async fn apply_services(&mut self, helper: &mut TsxHelper, req: Request) {
        if let Some(link) = self.as_chain_link.as_mut() {
            match link.next_trigger(&req) {
                Trigger::Match {
                    server,
                    resume_token,
                } => {
                    self.current_default_handling = Some(server.default_handling);
                    self.route_to_as(helper, req, &server.server_name, &resume_token);
                    return;
                }
                Trigger::End => {}
            }
        }
        self.route_to_target(helper, req).await;
    }

    /// Route via an application server, with the return Route that resumes
    /// the chain.
    fn route_to_as(
        &mut self,
        helper: &mut TsxHelper,
        mut req: Request,
        server_name: &str,
        resume_token: &str,
    ) {
        let as_uri: Uri = match server_name.parse() {
            Ok(uri) => uri,
            Err(_) => {
                warn!(server_name, "unparseable application server URI");
                helper.reject(StatusCode::INTERNAL_SERVER_ERROR, None);
                return;
            }
        };

        // Return Route first so it sits under the server's own Route.
        let mut return_uri: Uri = match self.config.scscf_uri.parse() {
            Ok(uri) => uri,
            Err(_) => {
                helper.reject(StatusCode::INTERNAL_SERVER_ERROR, None);
                return;
            }
        };
        return_uri.user = Some(resume_token.to_string());
        return_uri.set_param("lr", None);
        return_uri.set_param("sescase", Some(&self.session_case.to_string()));
        req.push_route_front(NameAddr::new(return_uri));

        let mut as_route = as_uri;
        as_route.set_param("lr", None);
        req.push_route_front(NameAddr::new(as_route));

        self.request_record_route(helper, &req, RouteHop::AppServer);
        debug!(server_name, "routing to application server");
        let fork_id = helper.send_request(req);
        self.as_fork = Some(fork_id);
        self.liveness_timer =
            Some(helper.start_timer(self.config.as_liveness_timeout, fork_id as u64));
    }

    /// The chain is complete: pick the final destination.
    async fn route_to_target(&mut self, helper: &mut TsxHelper, mut req: Request) {
        // TEL targets go through number translation first.
        if req.uri.is_tel() {
            let number = req.uri.user().unwrap_or("").to_string();
            match self
                .enum_service
                .translate(&number)
                .and_then(|t| t.parse::<Uri>().ok())
            {
                Some(translated) => {
                    debug!(number, uri = %translated, "ENUM translation");
                    req.uri = translated;
                }
                None => {
                    self.route_to_bgcf(helper, req);
                    return;
                }
            }
        }

        let target_local = self.config.is_home_domain(&req.uri.host);

        if self.session_case.is_originating() {
            if target_local {
                // Loop back into the terminating side of this node.
                let mut uri: Uri = match self.config.scscf_uri.parse() {
                    Ok(u) => u,
                    Err(_) => {
                        helper.reject(StatusCode::INTERNAL_SERVER_ERROR, None);
                        return;
                    }
                };
                uri.set_param("lr", None);
                req.push_route_front(NameAddr::new(uri));
                self.request_record_route(helper, &req, RouteHop::Edge);
                debug!("callee is local; looping to terminating side");
                helper.send_request(req);
            } else {
                // Off-net: straight SIP routing, or breakout for anything
                // else.
                if req.uri.is_sip() {
                    self.request_record_route(helper, &req, RouteHop::Edge);
                    helper.send_request(req);
                } else {
                    self.route_to_bgcf(helper, req);
                }
            }
            return;
        }

        if !target_local {
            // Terminating side but not our user: hand to the I-CSCF when
            // one is configured.
            if let Some(icscf) = self
                .config
                .icscf_uri
                .clone()
                .and_then(|u| u.parse::<Uri>().ok())
            {
                let mut route = icscf;
                route.set_param("lr", None);
                req.push_route_front(NameAddr::new(route));
            }
            self.request_record_route(helper, &req, RouteHop::Icscf);
            helper.send_request(req);
            return;
        }

        self.route_to_ue_bindings(helper, req).await;
    }

    fn route_to_bgcf(&self, helper: &mut TsxHelper, mut req: Request) {
        match self
            .config
            .bgcf_uri
            .clone()
            .and_then(|u| u.parse::<Uri>().ok())
        {
            Some(mut bgcf) => {
                bgcf.set_param("lr", None);
                req.push_route_front(NameAddr::new(bgcf));
                self.request_record_route(helper, &req, RouteHop::Edge);
                debug!("routing to BGCF");
                helper.send_request(req);
            }
            None => {
                info!("no breakout route configured; rejecting off-net target");
                helper.reject(StatusCode::NOT_FOUND, None);
            }
        }
    }

    /// Fork to every live binding of the target AoR.
    async fn route_to_ue_bindings(&mut self, helper: &mut TsxHelper, req: Request) {
        let aor = req.uri.canonical();
        let record = match self.store.get_aor(&aor).await {
            Ok(r) => r,
            Err(e) => {
                warn!(aor, error = %e, "binding lookup failed");
                helper.reject(StatusCode::SERVER_TIMEOUT, None);
                return;
            }
        };

        let now = now_secs();
        self.request_record_route(helper, &req, RouteHop::Edge);
        let mut forked = false;
        for (binding_id, binding) in record.active_bindings(now) {
            let contact_uri: Uri = match binding.uri.parse() {
                Ok(u) => u,
                Err(e) => {
                    warn!(aor, binding = binding_id, error = %e, "bad stored contact URI");
                    continue;
                }
            };
            let mut fork = helper.clone_request(&req);
            fork.uri = contact_uri;
            // The binding's path is the route set toward the UE.
            for path in binding.path_headers.iter().rev() {
                if let Ok(route) = path.parse::<NameAddr>() {
                    fork.push_route_front(route);
                }
            }
            let fork_id = helper.send_request(fork);
            self.target_bindings.insert(fork_id, binding_id.clone());
            forked = true;
        }

        if !forked {
            debug!(aor, "no registered bindings");
            helper.reject(StatusCode::TEMPORARILY_UNAVAILABLE, None);
            return;
        }
        self.target_aor = Some(aor);
    }

    /// Final response from the application server currently holding the
    /// request.
    async fn on_as_response(&mut self, helper: &mut TsxHelper, rsp: Response) {
        if !rsp.status.is_final() {
            // The server is alive; the wait is now bounded by normal
            // transaction timers.
            if let Some(timer) = self.liveness_timer.take() {
                helper.cancel_timer(timer);
            }
            if rsp.status != StatusCode::TRYING {
                helper.send_response(rsp);
            }
            return;
        }

        if let Some(timer) = self.liveness_timer.take() {
            helper.cancel_timer(timer);
        }
        self.as_fork = None;

        if rsp.status.is_success() || rsp.status.class() == 3 {
            // 3xx is not consumed here: redirect handling belongs
            // upstream.
            helper.send_response(rsp);
            return;
        }

        match self
            .current_default_handling
            .unwrap_or(DefaultHandling::SessionContinued)
        {
            DefaultHandling::SessionTerminated => {
                debug!(status = rsp.status.as_u16(), "server failed; terminating session");
                helper.send_response(rsp);
            }
            DefaultHandling::SessionContinued => {
                info!(
                    status = rsp.status.as_u16(),
                    "server failed; continuing chain without it"
                );
                if let Some(base) = self.base_req.clone() {
                    self.apply_services(helper, base).await;
                } else {
                    helper.send_response(rsp);
                }
            }
        }
    }

    async fn remove_binding(&self, aor: &str, binding_id: &str) {
        loop {
            let mut record = match self.store.get_aor(aor).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(aor, error = %e, "binding removal read failed");
                    return;
                }
            };
            if record
                .remove_binding(binding_id, ContactEvent::Deactivated)
                .is_none()
            {
                return;
            }
            match self.store.set_aor(aor, &mut record, true).await {
                Ok(SetOutcome::Written { .. }) => return,
                Ok(SetOutcome::Contention) => continue,
                Err(e) => {
                    warn!(aor, error = %e, "binding removal write failed");
                    return;
                }
            }
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
