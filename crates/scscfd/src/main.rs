//! scscfd: the S-CSCF signaling node daemon.
//!
//! Wires the registration store, HSS client, registrar, AS chain engine and
//! the sproutlet proxy together, listens for SIP over UDP and for timer
//! callbacks over HTTP, and runs until interrupted.

mod chronos;
mod enum_file;
mod http;
mod sender;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scscf_as_chain::AsChainTable;
use scscf_core::config::RecordRouteModel;
use scscf_core::{NullEnumService, ScscfConfig, ScscfSproutlet};
use scscf_hss_client::HssClient;
use scscf_reg_store::{MemoryKvStore, NoopTimerService, RegStore, TimerService};
use scscf_registrar_core::{
    RegistrarConfig, RegistrarSproutlet, RegistrarService, SubscriptionSproutlet,
};
use scscf_sproutlet_core::{ProxyConfig, Sproutlet, SproutletProxy, UdpTransport};

use crate::enum_file::FileEnumService;
use crate::sender::{LateSender, ProxyNotifySink};

#[derive(Parser, Debug)]
#[command(name = "scscfd", about = "IMS S-CSCF signaling node")]
struct Args {
    /// SIP signaling port.
    #[arg(long, default_value_t = 5054)]
    port: u16,

    /// Primary home domain.
    #[arg(long)]
    home_domain: String,

    /// Additional home domains.
    #[arg(long = "additional-home-domain")]
    additional_home_domains: Vec<String>,

    /// Extra hostnames that mean this node.
    #[arg(long = "alias")]
    aliases: Vec<String>,

    /// This node's cluster S-CSCF URI; defaults to
    /// sip:scscf.<home-domain>:<port>.
    #[arg(long)]
    scscf_uri: Option<String>,

    /// I-CSCF URI for requests to non-local served users.
    #[arg(long)]
    icscf_uri: Option<String>,

    /// BGCF URI for off-net breakout.
    #[arg(long)]
    bgcf_uri: Option<String>,

    /// Maximum REGISTER expiry granted, seconds.
    #[arg(long, default_value_t = 300)]
    max_expires: u32,

    /// Session interval forced onto INVITEs, seconds.
    #[arg(long, default_value_t = 600)]
    session_expires: u32,

    /// Worker threads for the runtime.
    #[arg(long, default_value_t = 1)]
    worker_threads: usize,

    /// HSS endpoint, e.g. http://hss.example.com:8888.
    #[arg(long)]
    hss: String,

    /// Timer-service endpoint, e.g. http://chronos.example.com:7253.
    #[arg(long)]
    chronos: Option<String>,

    /// HTTP port for timer callbacks.
    #[arg(long, default_value_t = 9888)]
    http_port: u16,

    /// Record-routing model: pcscf | pcscf,icscf | pcscf,icscf,as.
    #[arg(long, default_value = "pcscf,icscf")]
    record_route_model: String,

    /// Accept emergency registrations.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    allow_emergency: bool,

    /// ENUM mapping file (JSON object of number to URI).
    #[arg(long)]
    enum_file: Option<String>,

    /// Application-server liveness timeout, milliseconds.
    #[arg(long, default_value_t = 4000)]
    as_timeout_ms: u64,

    /// Run a second in-process store as a geo-redundancy stand-in.
    #[arg(long)]
    remote_store: bool,

    /// Sustained inbound request rate before 503-ing new work.
    #[arg(long)]
    max_inbound_rate: Option<f64>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.worker_threads.max(1))
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let scscf_uri = args
        .scscf_uri
        .clone()
        .unwrap_or_else(|| format!("sip:scscf.{}:{}", args.home_domain, args.port));
    let mut home_domains = vec![args.home_domain.clone()];
    home_domains.extend(args.additional_home_domains.iter().cloned());

    info!(
        home_domain = args.home_domain,
        scscf_uri, port = args.port, "starting scscfd"
    );

    // Late-bound sender: services need it at construction, the proxy only
    // exists afterwards.
    let sender = Arc::new(LateSender::new());

    // Stores.  The KV seam is where a clustered store would plug in; this
    // build ships the in-memory implementation.
    let timer_service: Arc<dyn TimerService> = match &args.chronos {
        Some(endpoint) => Arc::new(chronos::ChronosTimerService::new(
            endpoint.clone(),
            format!("http://127.0.0.1:{}/timers", args.http_port),
        )),
        None => Arc::new(NoopTimerService),
    };
    let notify_sink = Arc::new(ProxyNotifySink::new(sender.clone()));

    let remote_store = args.remote_store.then(|| {
        Arc::new(RegStore::new(
            Arc::new(MemoryKvStore::new()),
            Arc::new(NoopTimerService),
            notify_sink.clone(),
        ))
    });
    let mut local_store = RegStore::new(
        Arc::new(MemoryKvStore::new()),
        timer_service,
        notify_sink.clone(),
    );
    if let Some(remote) = &remote_store {
        local_store = local_store.with_backup(remote.clone());
    }
    let local_store = Arc::new(local_store);

    // External collaborators.
    let hss = Arc::new(HssClient::new(args.hss.clone()));
    let enum_service: Arc<dyn scscf_core::EnumService> = match &args.enum_file {
        Some(path) => Arc::new(FileEnumService::load(path).context("loading ENUM file")?),
        None => Arc::new(NullEnumService),
    };

    // Services.
    let mut registrar_config = RegistrarConfig::new(args.home_domain.clone(), scscf_uri.clone());
    registrar_config.home_domains = home_domains.clone();
    registrar_config.local_aliases = args.aliases.clone();
    registrar_config.max_expires = args.max_expires;
    registrar_config.allow_emergency = args.allow_emergency;

    let mut scscf_config = ScscfConfig::new(args.home_domain.clone(), scscf_uri.clone());
    scscf_config.home_domains = home_domains.clone();
    scscf_config.icscf_uri = args.icscf_uri.clone();
    scscf_config.bgcf_uri = args.bgcf_uri.clone();
    scscf_config.session_expires = args.session_expires;
    scscf_config.as_liveness_timeout = Duration::from_millis(args.as_timeout_ms);
    scscf_config.record_route_model = parse_record_route_model(&args.record_route_model);

    let chain_table = Arc::new(AsChainTable::new());

    let registrar = Arc::new(RegistrarSproutlet::new(
        registrar_config.clone(),
        local_store.clone(),
        remote_store.clone(),
        hss.clone(),
        sender.clone(),
    ));
    let subscription = Arc::new(SubscriptionSproutlet::new(
        registrar_config,
        local_store.clone(),
        hss.clone(),
        sender.clone(),
    ));
    let scscf = Arc::new(ScscfSproutlet::new(
        scscf_config,
        local_store.clone(),
        hss.clone(),
        enum_service,
        chain_table.clone(),
    ));

    // Registration order doubles as the offer order for requests addressed
    // to the node itself; the S-CSCF is the catch-all and goes last.
    let sproutlets: Vec<Arc<dyn Sproutlet>> = vec![registrar, subscription, scscf];

    // Transport and proxy.
    let bind: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let transport = UdpTransport::bind(bind).await.context("binding SIP port")?;
    let sent_by = format!("{}:{}", args.home_domain, args.port);

    let mut proxy_config = ProxyConfig::new(args.home_domain.clone(), sent_by);
    proxy_config.home_domains = home_domains;
    proxy_config.local_aliases = args.aliases.clone();
    proxy_config.max_inbound_rate = args.max_inbound_rate;

    let proxy = Arc::new(SproutletProxy::new(
        proxy_config,
        transport.clone(),
        sproutlets,
    ));
    sender.bind(proxy.clone());

    // SIP receive loop.
    let (rx_tx, mut rx_rx) = mpsc::channel(1024);
    {
        let transport = transport.clone();
        tokio::spawn(async move {
            transport.run_rx_loop(rx_tx).await;
        });
    }
    {
        let proxy = proxy.clone();
        tokio::spawn(async move {
            while let Some((msg, src)) = rx_rx.recv().await {
                proxy.handle_message(msg, src).await;
            }
        });
    }

    // Timer-callback endpoint.
    let registrar_service = Arc::new(RegistrarService::new(
        local_store.clone(),
        remote_store.clone(),
        hss.clone(),
    ));
    let http_addr: SocketAddr = format!("0.0.0.0:{}", args.http_port).parse()?;
    tokio::spawn(http::serve(http_addr, registrar_service));

    // Housekeeping: expired AS chains.
    {
        let chain_table = chain_table.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tick.tick().await;
                chain_table.purge_expired();
            }
        });
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    Ok(())
}

fn parse_record_route_model(s: &str) -> RecordRouteModel {
    match s {
        "pcscf" => RecordRouteModel::Pcscf,
        "pcscf,icscf,as" => RecordRouteModel::PcscfIcscfAs,
        other => {
            if other != "pcscf,icscf" {
                warn!(model = other, "unknown record-route model; using pcscf,icscf");
            }
            RecordRouteModel::PcscfIcscf
        }
    }
}
