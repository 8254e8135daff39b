//! Distributor socket client.
//!
//! [`DistributorClient`] owns one connected stream, splits it into frames,
//! decodes each frame into an [`Event`], runs it through the flow lifecycle
//! engine and hands the event plus any evictions to an [`EventHandler`].
//! Ingestion is strictly sequential; only the handler may fan work out.

pub mod address;
mod error;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::export::health::HealthMetrics;
use crate::flow::{Eviction, FlowManager, StaleFlow};
use crate::protocol::{decode_event, Event, EventStats, Frame, FrameBuffer};

pub use address::{Address, Transport};
pub use error::ClientError;

use error::classify_io;

/// Number of failed lines kept for diagnostics.
pub const FAILED_LINES_KEPT: usize = 256;

/// Longest filter expression the six-digit command prefix can describe.
pub const MAX_FILTER_LEN: usize = 999_999;

/// Receives decoded events and flow evictions from the client.
///
/// Returning `false` marks the event as rejected; the client keeps
/// processing the batch and reports the rejection afterwards.
pub trait EventHandler: Send + Sync {
    /// Called once per decoded event, before its evictions.
    fn on_event(&self, event: &Event) -> impl Future<Output = bool> + Send;

    /// Called once per evicted flow. `event` is the record that triggered
    /// the eviction, `None` for application shutdown.
    fn on_flow_cleanup(
        &self,
        event: Option<&Event>,
        eviction: &Eviction,
    ) -> impl Future<Output = bool> + Send;
}

/// A frame that could not be applied.
#[derive(Debug, Clone)]
pub struct FailedLine {
    pub payload: Vec<u8>,
    pub error: String,
}

/// Bounded record of failed lines plus the total count.
#[derive(Debug, Default)]
pub struct FailedLines {
    recent: VecDeque<FailedLine>,
    total: u64,
}

impl FailedLines {
    fn record(&mut self, payload: Vec<u8>, error: &ClientError) {
        if self.recent.len() == FAILED_LINES_KEPT {
            self.recent.pop_front();
        }
        self.recent.push_back(FailedLine {
            payload,
            error: error.to_string(),
        });
        self.total += 1;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Most recent failures, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &FailedLine> {
        self.recent.iter()
    }
}

/// Client for one distributor connection.
pub struct DistributorClient<S = Transport> {
    stream: S,
    read_timeout: Option<Duration>,
    buffer: FrameBuffer,
    scratch: Vec<u8>,
    frames: VecDeque<Frame>,
    flows: FlowManager,
    failed: FailedLines,
    rejected: usize,
    received_bytes: u64,
    metrics: Option<Arc<HealthMetrics>>,
    stats: Option<Arc<EventStats>>,
}

impl<S> DistributorClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a connected stream. `read_timeout` of `None` blocks indefinitely.
    pub fn new(stream: S, read_timeout: Option<Duration>) -> Self {
        let buffer = FrameBuffer::new();
        let scratch = vec![0u8; buffer.capacity()];
        Self {
            stream,
            read_timeout,
            buffer,
            scratch,
            frames: VecDeque::new(),
            flows: FlowManager::new(),
            failed: FailedLines::default(),
            rejected: 0,
            received_bytes: 0,
            metrics: None,
            stats: None,
        }
    }

    /// Continue with the flow registry of a previous connection.
    pub fn with_flows(mut self, flows: FlowManager) -> Self {
        self.flows = flows;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_stats(mut self, stats: Arc<EventStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Ask the daemon to filter server-side. Written once, no reply.
    pub async fn send_filter(&mut self, expr: &str) -> Result<(), ClientError> {
        if expr.len() > MAX_FILTER_LEN {
            return Err(ClientError::FilterTooLong { len: expr.len() });
        }

        let command = format!("{:06}{}", expr.len(), expr);
        self.stream
            .write_all(command.as_bytes())
            .await
            .map_err(classify_io)?;
        self.stream.flush().await.map_err(classify_io)?;

        tracing::debug!(len = expr.len(), "sent filter command");
        Ok(())
    }

    /// Perform one read and move every completed frame onto the queue.
    ///
    /// Returns the number of new frames. Frames completed before a framing
    /// fault stay queued; a timeout leaves the buffer untouched.
    pub async fn receive(&mut self) -> Result<usize, ClientError> {
        let want = self.buffer.remaining().min(self.scratch.len());
        if want == 0 {
            return Err(ClientError::BufferCapacityReached {
                current: self.buffer.len(),
                max: self.buffer.capacity(),
            });
        }
        let scratch = self.scratch.get_mut(..want).unwrap_or_default();
        let read = self.stream.read(scratch);

        let result = match self.read_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, read).await {
                Ok(result) => result,
                Err(_) => return Err(ClientError::SocketTimeout(deadline)),
            },
            None => read.await,
        };

        let n = match result {
            Ok(0) => return Err(ClientError::broken("peer closed the connection")),
            Ok(n) => n,
            Err(e) => return Err(classify_io(e)),
        };

        if let Some(metrics) = &self.metrics {
            metrics.bytes_received.inc_by(n as f64);
        }

        let chunk = self.scratch.get(..n).unwrap_or_default();
        self.buffer.extend(chunk);

        let before = self.frames.len();
        let extracted = self.buffer.extract(&mut self.frames);

        for frame in self.frames.iter().skip(before) {
            self.received_bytes += frame.wire_len() as u64;
            if let Some(metrics) = &self.metrics {
                metrics.frames_received.inc();
                metrics.frame_size.observe(frame.payload.len() as f64);
            }
        }

        Ok(extracted?)
    }

    /// Drain queued frames in order through decoder, lifecycle engine and
    /// handler.
    ///
    /// Returns `Ok(false)` if any callback rejected. A per-line fault removes
    /// and records the offending frame and is returned immediately; the
    /// remaining frames stay queued. Frames that cannot be attributed to an
    /// instance are recorded and count as a rejection; draining continues.
    pub async fn parse<H: EventHandler>(&mut self, handler: &H) -> Result<bool, ClientError> {
        let mut accepted = true;

        while let Some(frame) = self.frames.pop_front() {
            match self.apply(&frame, handler).await {
                Ok(ok) => accepted &= ok,
                Err(err) => {
                    self.record_failure(frame.payload, &err);
                    let unattributable =
                        matches!(&err, ClientError::Decode(e) if e.is_unattributable());
                    if !unattributable {
                        return Err(err);
                    }
                    tracing::warn!(error = %err, "rejecting unattributable line");
                    accepted = self.count(false);
                }
            }
        }

        Ok(accepted)
    }

    /// Read and process until the connection fails.
    pub async fn run<H: EventHandler>(&mut self, handler: &H) -> Result<(), ClientError> {
        self.run_until(handler, &CancellationToken::new()).await
    }

    /// Read and process until the connection fails or `cancel` fires.
    ///
    /// Every buffered frame is processed before a receive fault is surfaced.
    /// Rejections of a batch raise [`ClientError::CallbackReturnedFalse`].
    pub async fn run_until<H: EventHandler>(
        &mut self,
        handler: &H,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    self.drain(handler).await;
                    return self.take_rejections();
                }
                r = self.receive() => r,
            };

            self.drain(handler).await;
            self.take_rejections()?;
            received?;
        }
    }

    /// Process every queued frame, logging per-line faults.
    pub async fn drain<H: EventHandler>(&mut self, handler: &H) {
        while !self.frames.is_empty() {
            if let Err(err) = self.parse(handler).await {
                tracing::warn!(error = %err, "skipping failed line");
            }
        }
    }

    /// Fails if any line failed, otherwise returns flows that are already
    /// behind their thread's high-water mark.
    pub fn verify(&self) -> Result<Vec<StaleFlow>, ClientError> {
        if !self.failed.is_empty() {
            return Err(ClientError::FailedLines {
                count: self.failed.total(),
            });
        }
        Ok(self.flows.verify())
    }

    /// Evict every tracked flow with reason `APP_SHUTDOWN`.
    pub fn shutdown(&mut self) -> Vec<Eviction> {
        let evictions = self.flows.shutdown();
        if let Some(metrics) = &self.metrics {
            for eviction in &evictions {
                metrics
                    .evictions
                    .with_label_values(&[eviction.reason().as_str()])
                    .inc();
            }
        }
        self.update_gauges();
        evictions
    }

    pub fn failed_lines(&self) -> &FailedLines {
        &self.failed
    }

    /// Total wire bytes of complete frames extracted so far.
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Frames extracted but not yet processed.
    pub fn pending_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn flows(&self) -> &FlowManager {
        &self.flows
    }

    /// Release the flow registry, e.g. to carry it across a reconnect.
    pub fn into_flows(self) -> FlowManager {
        self.flows
    }

    async fn apply<H: EventHandler>(
        &mut self,
        frame: &Frame,
        handler: &H,
    ) -> Result<bool, ClientError> {
        let event = decode_event(&frame.payload)?;
        let category = event.category();

        if let Some(stats) = &self.stats {
            stats.record(category);
        }
        if let Some(metrics) = &self.metrics {
            metrics
                .events_by_category
                .with_label_values(&[category.as_str()])
                .inc();
        }

        let evictions = self.flows.process(&event)?;
        self.update_gauges();

        let mut accepted = self.count(handler.on_event(&event).await);

        for eviction in &evictions {
            tracing::debug!(
                instance = %eviction.instance,
                flow_id = eviction.flow_id(),
                reason = %eviction.reason(),
                "flow evicted",
            );
            if let Some(metrics) = &self.metrics {
                metrics
                    .evictions
                    .with_label_values(&[eviction.reason().as_str()])
                    .inc();
            }
            accepted &= self.count(handler.on_flow_cleanup(Some(&event), eviction).await);
        }

        Ok(accepted)
    }

    fn count(&mut self, accepted: bool) -> bool {
        if !accepted {
            self.rejected += 1;
        }
        accepted
    }

    fn take_rejections(&mut self) -> Result<(), ClientError> {
        match std::mem::take(&mut self.rejected) {
            0 => Ok(()),
            rejected => Err(ClientError::CallbackReturnedFalse { rejected }),
        }
    }

    fn record_failure(&mut self, payload: Vec<u8>, err: &ClientError) {
        if let Some(metrics) = &self.metrics {
            metrics.failed_lines.with_label_values(&[err.kind()]).inc();
        }
        self.failed.record(payload, err);
    }

    fn update_gauges(&self) {
        if let Some(metrics) = &self.metrics {
            metrics
                .instances_tracked
                .set(self.flows.instance_count() as f64);
            metrics.flows_tracked.set(self.flows.flow_count() as f64);
        }
    }
}
