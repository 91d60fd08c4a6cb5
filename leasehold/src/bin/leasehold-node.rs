use leasehold::{
    config::EngineConfig, tcp::TcpTransport, ListenEndpoint, LeaseEngine, LeaseEvent, Result,
    SecuritySettings,
};
use std::{env, path::Path, sync::Arc, time::Duration};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match env::var("LEASEHOLD_CONFIG") {
        Ok(path) => EngineConfig::from_file(Path::new(&path))?,
        Err(_) => EngineConfig::default(),
    };
    let listen: ListenEndpoint = env::var("LEASEHOLD_LISTEN")
        .unwrap_or_else(|_| "127.0.0.1:7400".to_string())
        .parse()?;
    let app_name = env::var("LEASEHOLD_APP").unwrap_or_else(|_| format!("node-{}", listen.port));

    info!("leasehold node starting on {}", listen);
    let engine = LeaseEngine::new(config.clone(), Arc::new(TcpTransport::new()));
    engine.start();
    let agent = engine
        .create_lease_agent(listen.clone(), config.durations.clone(), SecuritySettings::default())
        .await?;
    let app = engine.create_leasing_application(agent.instance, &app_name, true, std::process::id())?;
    info!("lease agent {} hosting application {}", agent.instance, app_name);

    // LEASEHOLD_PEERS=host:port/app,host:port/app
    if let Ok(peers) = env::var("LEASEHOLD_PEERS") {
        for peer in peers.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((endpoint, remote_app)) = peer.split_once('/') else {
                warn!("ignoring peer {peer:?}, expected host:port/app");
                continue;
            };
            let endpoint: ListenEndpoint = endpoint.parse()?;
            match engine.establish_lease(app, &endpoint, remote_app, leasehold::DurationType::Regular) {
                Ok(lease) => info!("establishing lease {} with {}/{}", lease.lease.0, endpoint, remote_app),
                Err(e) => error!("establish with {} failed: {}", endpoint, e),
            }
        }
    }

    let heartbeat = engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            heartbeat.heartbeat(0);
        }
    });

    loop {
        let registration = engine.register_leasing_application(app)?;
        tokio::select! {
            event = registration.recv() => match event? {
                LeaseEvent::Arbitrate(request) if !request.is_pre_arbitration => {
                    warn!("arbitration requested for {}, no arbitrator configured", request.remote_endpoint);
                }
                LeaseEvent::LeasingApplicationExpired => {
                    error!("local lease expired, shutting down");
                    break;
                }
                event => info!("lease event: {:?}", event),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    engine.shutdown();
    Ok(())
}
