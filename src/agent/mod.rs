use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{Address, ClientError, DistributorClient};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::export::health::HealthMetrics;
use crate::flow::FlowManager;
use crate::protocol::EventStats;
use crate::sink::{JsonFileSink, Sink};

/// How one connection ended.
enum Session {
    /// The cancellation token fired.
    Cancelled,
    /// The connection failed and may be re-established.
    Lost(ClientError),
}

/// Agent wires the distributor client, flow registry, dispatcher and sink
/// together and keeps them running until cancelled.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    sink: Arc<dyn Sink>,
    captured_stats: Arc<EventStats>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates an agent writing to the JSON file sink described by `cfg`.
    pub fn new(cfg: Config) -> Result<Self> {
        let sink = JsonFileSink::new(&cfg.output, &cfg.events).context("creating file sink")?;
        Self::with_sink(cfg, Arc::new(sink))
    }

    /// Creates an agent delivering to an arbitrary sink.
    pub fn with_sink(cfg: Config, sink: Arc<dyn Sink>) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            sink,
            captured_stats: Arc::new(EventStats::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops [`Agent::run`] when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Ingest until cancelled or the connection fails for good.
    ///
    /// Tracked flows are always flushed to the sink with reason
    /// `APP_SHUTDOWN` before returning, even on error.
    pub async fn run(&self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        if !self.cfg.any_enabled() {
            warn!("no event category enabled, events will only be tracked");
        }

        let dispatcher = Dispatcher::start(
            &self.cfg.events,
            Arc::clone(&self.sink),
            Some(Arc::clone(&self.health)),
        );

        let reporter = self.cancel.child_token();
        self.spawn_event_stats_reporter(reporter.clone());

        let mut flows = FlowManager::new();
        let result = self.ingest(&dispatcher, &mut flows).await;

        // Flush what is still tracked.
        report_stale_flows(&flows);
        let evictions = flows.shutdown();
        if !evictions.is_empty() {
            info!(count = evictions.len(), "flushing tracked flows");
        }
        for eviction in &evictions {
            self.health
                .evictions
                .with_label_values(&[eviction.reason().as_str()])
                .inc();
            if !dispatcher.dispatch_eviction(None, eviction).await {
                warn!(flow_id = eviction.flow_id(), "dispatcher closed during flush");
            }
        }
        self.health.instances_tracked.set(0.0);
        self.health.flows_tracked.set(0.0);

        dispatcher.shutdown().await;
        reporter.cancel();
        self.health.stop();

        info!("agent stopped");

        result
    }

    /// Connection loop. `flows` carries the registry across reconnects.
    async fn ingest(&self, dispatcher: &Dispatcher, flows: &mut FlowManager) -> Result<()> {
        let conn = &self.cfg.connection;
        let address = Address::select(conn.host.as_deref(), conn.port, conn.unix.as_deref());

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let outcome = match address.connect().await {
                Ok(transport) => {
                    info!(address = %address, kind = address.kind(), "connected to distributor");
                    self.health
                        .connects
                        .with_label_values(&[address.kind()])
                        .inc();
                    self.health.connected.set(1.0);

                    let mut client = DistributorClient::new(transport, conn.read_timeout)
                        .with_flows(std::mem::take(flows))
                        .with_metrics(Arc::clone(&self.health))
                        .with_stats(Arc::clone(&self.captured_stats));

                    let session = self.session(&mut client, dispatcher).await;
                    *flows = client.into_flows();
                    self.health.connected.set(0.0);
                    session
                }
                Err(e) => Session::Lost(e),
            };

            let err = match outcome {
                Session::Cancelled => return Ok(()),
                Session::Lost(err) => err,
            };

            self.health
                .disconnects
                .with_label_values(&[err.kind()])
                .inc();

            let retry = conn.reconnect
                && matches!(
                    err,
                    ClientError::ConnectionBroken { .. } | ClientError::Io(_)
                );
            if !retry {
                error!(address = %address, error = %err, "distributor connection failed");
                return Err(err).with_context(|| format!("reading from {address}"));
            }

            warn!(
                address = %address,
                error = %err,
                retry_in = ?conn.reconnect_interval,
                "distributor connection lost, reconnecting",
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(conn.reconnect_interval) => {}
            }
        }
    }

    /// Drive one connected client until cancellation or a fatal fault.
    async fn session<S>(
        &self,
        client: &mut DistributorClient<S>,
        dispatcher: &Dispatcher,
    ) -> Session
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
    {
        if let Some(filter) = &self.cfg.connection.filter {
            if let Err(e) = client.send_filter(filter).await {
                return Session::Lost(e);
            }
            info!(filter = %filter, "sent distributor filter");
        }

        loop {
            match client.run_until(dispatcher, &self.cancel).await {
                Ok(()) => return Session::Cancelled,
                Err(e) if e.is_recoverable() => {
                    debug!(error = %e, "read timed out, retrying");
                    report_stale_flows(client.flows());
                }
                Err(ClientError::CallbackReturnedFalse { rejected }) if !dispatcher.is_closed() => {
                    warn!(rejected, "lines rejected, continuing");
                }
                Err(e) => return Session::Lost(e),
            }
        }
    }

    /// Spawn background event stats reporter.
    fn spawn_event_stats_reporter(&self, cancel: CancellationToken) {
        let captured_stats = Arc::clone(&self.captured_stats);
        let interval = self.cfg.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = captured_stats.snapshot();
                        let total: u64 = snapshot.iter().map(|(_, n)| n).sum();

                        if total == 0 {
                            continue;
                        }

                        info!(received = total, interval = ?interval, "event stats");

                        for (category, count) in &snapshot {
                            debug!(category = %category, count, "  by category");
                        }
                    }
                }
            }
        });
    }
}

/// Log flows already behind their thread's high-water mark. Returns how many
/// were found.
fn report_stale_flows(flows: &FlowManager) -> usize {
    let stale = flows.verify();
    for flow in &stale {
        debug!(
            instance = %flow.instance,
            flow_id = flow.flow_id,
            thread_id = flow.thread_id,
            expires_at = flow.expires_at,
            high_water_mark = flow.high_water_mark,
            "stale flow",
        );
    }
    if !stale.is_empty() {
        debug!(count = stale.len(), "stale flows tracked");
    }
    stale.len()
}
