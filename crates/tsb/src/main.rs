use std::sync::Arc;

use anyhow::Context;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tsb_core::{
    broadcast::Broadcaster,
    classifier::Classifier,
    config::Config,
    connection::{ConnectionManager, ConnectionSettings},
    health::HealthMonitor,
    history::HistoryBuffer,
    name_cache::EntityNameCache,
    pipeline::EventPipeline,
    ports::{GatewayPort, GenerativeModel},
    supervised::{fault_channel, SupervisedGateway},
};
use tsb_gemini::GeminiClient;
use tsb_telegram::TelegramGateway;
use tsb_viewer::ViewerState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tsb_core::logging::init("tsb")?;

    let cfg = Config::load()?;
    if cfg.session_credential.is_none() {
        warn!("TG_SESSION is not set; the gateway will report OFFLINE");
    }
    info!(
        api_id = ?cfg.api_id,
        api_hash_set = cfg.api_hash.is_some(),
        target = ?cfg.target_conversation,
        "gateway configuration"
    );
    if cfg.gemini_api_key.is_none() {
        warn!("GEMINI_API_KEY is not set; the classifier will report OFFLINE");
    }

    let (fault_tx, fault_rx) = fault_channel(16);
    let (recheck_tx, recheck_rx) = mpsc::channel(16);

    let gateway: Arc<dyn GatewayPort> = Arc::new(TelegramGateway::from_config(&cfg));
    let supervised: Arc<dyn GatewayPort> =
        Arc::new(SupervisedGateway::new(gateway.clone(), fault_tx.clone()));

    let gemini = GeminiClient::from_config(&cfg)?;
    info!(model = gemini.model(), "classifier configured");
    let model: Arc<dyn GenerativeModel> = Arc::new(gemini);
    let classifier = Arc::new(
        Classifier::new(model, cfg.classifier_timeout).with_cache(cfg.classification_cache_size),
    );

    let broadcaster = Arc::new(Broadcaster::new(
        HistoryBuffer::new(cfg.history_limit),
        cfg.viewer_queue_size,
        recheck_tx,
    ));

    let pipeline = Arc::new(EventPipeline::new(
        supervised.clone(),
        EntityNameCache::new(cfg.upstream_timeout),
        classifier.clone(),
        broadcaster.clone(),
        cfg.classify_concurrency,
    ));

    let manager = Arc::new(ConnectionManager::new(
        gateway,
        pipeline,
        ConnectionSettings::from_config(&cfg),
        fault_tx,
    ));

    let monitor = Arc::new(HealthMonitor::new(
        supervised,
        classifier,
        broadcaster.clone(),
        manager.subscribe_status(),
        cfg.health_interval,
        cfg.upstream_timeout,
    ));

    let listen_addr = cfg.listen_addr();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding viewer listener on {listen_addr}"))?;

    let cancel = CancellationToken::new();

    let manager_task = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(fault_rx, cancel).await })
    };
    let monitor_task = {
        let monitor = monitor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { monitor.run(recheck_rx, cancel).await })
    };
    let mut server_task = tokio::spawn(tsb_viewer::serve(
        listener,
        ViewerState::new(broadcaster),
        cancel.clone(),
    ));

    info!(addr = %listen_addr, "signal bridge started");

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listening for ctrl-c")?;
            info!("shutdown requested");
        }
        res = &mut server_task => {
            cancel.cancel();
            let _ = tokio::join!(manager_task, monitor_task);
            res.context("viewer server task panicked")??;
            anyhow::bail!("viewer server stopped unexpectedly");
        }
    }

    cancel.cancel();
    let (manager_res, monitor_res, server_res) =
        tokio::join!(manager_task, monitor_task, server_task);
    manager_res.context("connection manager task panicked")?;
    monitor_res.context("health monitor task panicked")?;
    server_res.context("viewer server task panicked")??;

    info!("signal bridge stopped");
    Ok(())
}
