use clap::Parser;
use sbc_sip_sidecar::admission::{
    AdmissionConfig, AdmissionPipeline, InMemoryRegistrar, RedisRegistrar, RegistrationStore,
    UnavailableAuthenticator,
};
use sbc_sip_sidecar::alerts::{StatsSink, TracingAlertSink, TracingStats};
use sbc_sip_sidecar::catalog::InMemoryCatalog;
use sbc_sip_sidecar::config::Config;
use sbc_sip_sidecar::health::{
    HealthMonitor, HealthSettings, OptionsProber, ProberSettings, ServerKind,
};
use sbc_sip_sidecar::regbot::{ManagerSettings, RegbotManager};
use sbc_sip_sidecar::sip::{InboundHandlers, PublicAddresses, SipEndpoint};
use sbc_sip_sidecar::store::{InMemoryStore, KeyValueStore, RedisStore};
use sbc_sip_sidecar::{user_agent, utils, StoreError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    utils::initialize_logging(config.log_level.as_str());
    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        return Err(e.into());
    }
    info!(
        "starting sbc-sip-sidecar {} cluster={} hosting={}",
        sbc_sip_sidecar::VERSION,
        config.cluster_id,
        config.hosting
    );

    let catalog = match &config.catalog_file {
        Some(path) => {
            info!("loading catalog from {}", path.display());
            Arc::new(InMemoryCatalog::from_json_file(path)?)
        }
        None => Arc::new(InMemoryCatalog::new()),
    };
    let (store, registrar) = open_shared_state(&config).await?;
    let alerts = Arc::new(TracingAlertSink);
    let stats: Arc<dyn StatsSink> = Arc::new(TracingStats);

    let cancel_token = CancellationToken::new();
    let agent = user_agent();
    let endpoint = SipEndpoint::bind(config.sip_listen, &agent, cancel_token.child_token());
    let endpoint = Arc::new(endpoint.await?);
    endpoint.serve();
    let incoming = endpoint.incoming()?;

    let public_addresses = discover_public_addresses(&config, &endpoint);
    info!("public addresses: {:?}", public_addresses);

    let admission = Arc::new(AdmissionPipeline::new(
        AdmissionConfig {
            hosting: config.hosting,
            nat_expires: config.nat_expires,
        },
        registrar,
        catalog.clone(),
        alerts.clone(),
        stats.clone(),
    ));
    let health = Arc::new(HealthMonitor::new(
        HealthSettings::from_config(&config),
        store.clone(),
        stats.clone(),
    ));
    let prober = Arc::new(OptionsProber::new(
        ProberSettings::from_config(&config),
        store.clone(),
        catalog.clone(),
        endpoint.clone(),
        alerts.clone(),
    ));
    let manager = Arc::new(RegbotManager::new(
        ManagerSettings::from_config(&config, public_addresses),
        store,
        catalog,
        endpoint.clone(),
        alerts,
    ));
    info!("regbot lease token {}", manager.token());

    let handlers = Arc::new(InboundHandlers::new(
        admission,
        Arc::new(UnavailableAuthenticator),
        health.clone(),
    ));

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(handlers.serve(incoming, cancel_token.child_token())));
    tasks.push(tokio::spawn(health.clone().run(cancel_token.child_token())));
    tasks.push(tokio::spawn(prober.run(cancel_token.child_token())));
    tasks.push(tokio::spawn(manager.clone().run(cancel_token.child_token())));
    tasks.push(tokio::spawn(emit_gauges(
        manager,
        health,
        stats,
        config.lease_check_interval(),
        cancel_token.child_token(),
    )));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    cancel_token.cancel();
    for result in futures_util::future::join_all(tasks).await {
        if let Err(e) = result {
            warn!("task ended abnormally: {}", e);
        }
    }
    endpoint.shutdown();
    Ok(())
}

/// 配置了 Redis 时所有副本共享状态；否则退回进程内实现
async fn open_shared_state(
    config: &Config,
) -> Result<(Arc<dyn KeyValueStore>, Arc<dyn RegistrationStore>), StoreError> {
    let Some(url) = config.redis_url() else {
        warn!("no redis configured, using in-process store; run a single replica only");
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryStore::new());
        let registrar: Arc<dyn RegistrationStore> = Arc::new(InMemoryRegistrar::new());
        return Ok((store, registrar));
    };
    let shared = RedisStore::connect(&url).await?;
    let registrar: Arc<dyn RegistrationStore> = Arc::new(RedisRegistrar::new(shared.connection()));
    let store: Arc<dyn KeyValueStore> = Arc::new(shared);
    Ok((store, registrar))
}

/// 对外地址：优先使用配置；否则用发现的网卡地址加监听端口
fn discover_public_addresses(config: &Config, endpoint: &SipEndpoint) -> PublicAddresses {
    let mut addresses = PublicAddresses::new();
    for (transport, address) in [
        ("udp", &config.public_address_udp),
        ("tcp", &config.public_address_tcp),
        ("tls", &config.public_address_tls),
    ] {
        if let Some(address) = address {
            addresses.insert(transport, address.clone());
        }
    }
    if !addresses.is_empty() {
        return addresses;
    }

    let port = config.sip_listen.port();
    if !config.sip_listen.ip().is_unspecified() {
        addresses.insert("udp", format!("{}:{}", config.sip_listen.ip(), port));
        return addresses;
    }
    match utils::get_first_non_loopback_interface(config.exclude_private_addresses) {
        Ok(ip) => addresses.insert("udp", format!("{}:{}", ip, port)),
        Err(e) => {
            warn!("could not discover public address: {}", e);
            if let Some(local) = endpoint.local_addresses().into_iter().next() {
                addresses.insert("udp", local);
            }
        }
    }
    addresses
}

/// 周期性上报 regbot 与健康集合的规模
async fn emit_gauges(
    manager: Arc<RegbotManager>,
    health: Arc<HealthMonitor>,
    stats: Arc<dyn StatsSink>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let summary = manager.summary();
                stats.gauge("regbots.total", summary.total as f64, &[]);
                stats.gauge("regbots.registered", summary.registered as f64, &[]);
                stats.gauge("regbot.active", if summary.active { 1.0 } else { 0.0 }, &[]);
                for kind in [ServerKind::FeatureServer, ServerKind::RtpServer] {
                    stats.gauge(kind.gauge_name(), health.tracked(kind) as f64, &[]);
                }
            }
        }
    }
}
