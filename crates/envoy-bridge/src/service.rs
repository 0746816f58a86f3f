//! Service lifecycle: authenticate, connect, bootstrap, poll, shut down.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use envoy_client::{EnvoyApi, ReqwestBackend, SessionManager, TelemetrySource};
use envoy_metrics::{ReferenceConfig, ReferenceStore, ReferenceUpdate};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::BridgeConfig;
use crate::error::Result;
use crate::mqtt::MqttConnection;
use crate::publisher::Publisher;
use crate::scheduler::{Intervals, Scheduler, ShutdownRx, ShutdownTx};
use crate::status::{Liveness, StatusReporter};
use crate::topics::TopicLayout;

/// Capacity of the retained-reference channel.
pub const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Builds the reference store for `config`.
pub fn reference_store(config: &BridgeConfig) -> Result<Arc<ReferenceStore>> {
    let store = ReferenceStore::new(
        ReferenceConfig::default().with_rollover_window(config.schedule.rollover_window()),
    )?;
    Ok(Arc::new(store))
}

/// The wired-up bridge, independent of the concrete transports.
pub struct Bridge<S, P> {
    scheduler: Scheduler<S, P>,
    status: StatusReporter<P>,
    store: Arc<ReferenceStore>,
    grace: Duration,
}

impl<S: TelemetrySource, P: Publisher> Bridge<S, P> {
    /// Wires `source` and `publisher` according to `config`.
    pub fn new(
        config: &BridgeConfig,
        source: Arc<S>,
        publisher: Arc<P>,
        store: Arc<ReferenceStore>,
    ) -> Self {
        let layout = TopicLayout::new(&config.mqtt.base_topic, &config.envoy.serial_number);
        let status = StatusReporter::new(Arc::clone(&publisher), layout.status());
        let intervals = Intervals {
            raw: config.schedule.raw_interval(),
            full: config.schedule.full_interval(),
        };
        let scheduler = Scheduler::new(source, publisher, Arc::clone(&store), layout, intervals)
            .with_summaries(config.summaries.clone());

        Self {
            scheduler,
            status,
            store,
            grace: config.schedule.bootstrap_grace(),
        }
    }

    /// Replaces the wall clock used for midnight detection.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + Send + Sync + 'static) -> Self {
        self.scheduler = self.scheduler.with_clock(clock);
        self
    }

    /// Returns the reference store.
    #[must_use]
    pub fn store(&self) -> &Arc<ReferenceStore> {
        &self.store
    }

    /// Runs until `stop` fires.
    ///
    /// Publishes `online`, waits out the bootstrap grace window while retained
    /// references arrive on `updates`, starts both loops, and on shutdown lets
    /// in-flight cycles finish before publishing `offline`.
    pub async fn run(
        self,
        updates: mpsc::Receiver<ReferenceUpdate>,
        shutdown: &ShutdownTx,
        mut stop: ShutdownRx,
    ) {
        self.status.publish_status(Liveness::Online).await;

        info!(grace_ms = self.grace.as_millis(), "waiting for retained references");
        let bootstrap = self.store.bootstrap(updates, self.grace);
        let listener = tokio::select! {
            biased;
            _ = stop.recv() => None,
            listener = bootstrap => Some(listener),
        };

        let Some(listener) = listener else {
            info!("shutdown requested during bootstrap");
            self.status.publish_status(Liveness::Offline).await;
            return;
        };

        let loops = Arc::new(self.scheduler).spawn(shutdown);
        info!(loops = loops.len(), "bridge running");

        let _ = stop.recv().await;
        info!("shutting down, waiting for in-flight cycles");
        // Loops spawned after the signal missed it.
        let _ = shutdown.send(());

        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "polling loop panicked");
            }
        }
        listener.abort();

        self.status.publish_status(Liveness::Offline).await;
    }
}

/// Runs the bridge against real transports until `shutdown` fires.
///
/// An initial authentication failure is fatal; everything after that is
/// retried by the loops.
pub async fn run_service(config: &BridgeConfig, shutdown: &ShutdownTx, stop: ShutdownRx) -> Result<()> {
    let backend = Arc::new(ReqwestBackend::new()?);
    let session = Arc::new(SessionManager::new(backend, config.envoy.session_config()));

    info!(host = %config.envoy.host, serial = %config.envoy.serial_number, "authenticating with gateway");
    session.authenticate().await?;
    info!("gateway authentication succeeded");

    let source = Arc::new(EnvoyApi::new(session));
    let store = reference_store(config)?;
    let layout = TopicLayout::new(&config.mqtt.base_topic, &config.envoy.serial_number);

    let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
    let connection = MqttConnection::start(config, &layout, &store.subscription_keys(), update_tx);

    let bridge = Bridge::new(config, source, connection.publisher(), store);
    bridge.run(update_rx, shutdown, stop).await;

    connection.close().await;
    info!("bridge stopped");
    Ok(())
}

/// Authenticates once and reports the outcome.
pub async fn check_auth(config: &BridgeConfig) -> Result<()> {
    let backend = Arc::new(ReqwestBackend::new()?);
    let session = SessionManager::new(backend, config.envoy.session_config());

    match session.authenticate().await {
        Ok(()) => {
            let expires_at = session.session().await.expires_at;
            info!(?expires_at, "gateway accepted the token");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "gateway authentication failed");
            Err(e.into())
        }
    }
}
