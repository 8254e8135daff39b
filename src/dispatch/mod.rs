//! Per-category worker pools between ingestion and the sink.
//!
//! Each enabled category owns a bounded [`JobQueue`] and `workers` tasks that
//! pull jobs and call the [`Sink`] on the blocking pool. Every job carries its
//! own copy of the record, so pools never share mutable state with ingestion
//! or with each other. A sink failure or panic is counted and logged without
//! affecting other jobs or categories.

pub mod filter;
pub mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::task::JoinSet;

use crate::client::EventHandler;
use crate::config::EventsConfig;
use crate::export::health::HealthMetrics;
use crate::flow::Eviction;
use crate::protocol::{Category, Event};
use crate::sink::Sink;

pub use filter::EventFilter;
pub use queue::{JobQueue, PushOutcome};

/// One unit of sink work.
#[derive(Debug, Clone)]
pub struct Job {
    pub category: Category,
    pub event: Map<String, Value>,
    pub eviction: Option<Eviction>,
}

struct Pool {
    category: Category,
    filter: EventFilter,
    queue: Arc<JobQueue<Job>>,
}

/// Routes events and evictions into the per-category pools.
pub struct Dispatcher {
    pools: Vec<Pool>,
    workers: Mutex<JoinSet<()>>,
    sink: Arc<dyn Sink>,
    metrics: Option<Arc<HealthMetrics>>,
    closed: AtomicBool,
}

impl Dispatcher {
    /// Spawn the worker pools for every enabled category. Must be called
    /// inside a tokio runtime.
    pub fn start(
        cfg: &EventsConfig,
        sink: Arc<dyn Sink>,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let mut pools = Vec::new();
        let mut workers = JoinSet::new();

        for category in Category::all().iter().copied() {
            let events = cfg.get(category);
            if !events.enabled {
                continue;
            }

            let queue = Arc::new(JobQueue::new(events.queue_size, events.overflow));
            if let Some(m) = &metrics {
                m.queue_capacity
                    .with_label_values(&[category.as_str()])
                    .set(queue.capacity() as f64);
            }

            for _ in 0..events.workers.max(1) {
                workers.spawn(run_worker(
                    category,
                    Arc::clone(&queue),
                    Arc::clone(&sink),
                    metrics.clone(),
                ));
            }

            tracing::info!(
                category = %category,
                workers = events.workers,
                queue_size = queue.capacity(),
                overflow = events.overflow.as_str(),
                "dispatch pool started",
            );

            pools.push(Pool {
                category,
                filter: EventFilter::from_config(events),
                queue,
            });
        }

        Self {
            pools,
            workers: Mutex::new(workers),
            sink,
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a copy of `event` for its category.
    ///
    /// Returns `false` only once the dispatcher is closed; filtered and
    /// overflow-dropped events count as handled.
    pub async fn dispatch(&self, event: &Event) -> bool {
        if self.is_closed() {
            return false;
        }

        let category = event.category();
        let Some(pool) = self.pool(category) else {
            return true;
        };

        if !pool.filter.allows(event) {
            self.record_outcome(category, "filtered");
            return true;
        }

        let mut record = event.raw.clone();
        pool.filter.strip(&mut record);

        self.enqueue(
            pool,
            Job {
                category,
                event: record,
                eviction: None,
            },
        )
        .await
    }

    /// Queue an eviction on the flow pool. Without a triggering event a
    /// minimal record of the flow is sent instead.
    pub async fn dispatch_eviction(&self, event: Option<&Event>, eviction: &Eviction) -> bool {
        if self.is_closed() {
            return false;
        }

        let Some(pool) = self.pool(Category::Flow) else {
            return true;
        };

        let mut record = match event {
            Some(event) => event.raw.clone(),
            None => eviction.synthesized_record(),
        };
        pool.filter.strip(&mut record);

        self.enqueue(
            pool,
            Job {
                category: Category::Flow,
                event: record,
                eviction: Some(eviction.clone()),
            },
        )
        .await
    }

    /// Close every queue, wait for workers to drain them, then flush the sink.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for pool in &self.pools {
            pool.queue.close();
        }

        let mut workers = std::mem::take(&mut *self.workers.lock());
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "dispatch worker join failed");
            }
        }

        if let Err(e) = self.sink.flush() {
            tracing::warn!(sink = self.sink.name(), error = %e, "sink flush failed");
        }

        tracing::info!("dispatcher stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn pool(&self, category: Category) -> Option<&Pool> {
        self.pools.iter().find(|p| p.category == category)
    }

    async fn enqueue(&self, pool: &Pool, job: Job) -> bool {
        let outcome = pool.queue.push(job).await;
        self.record_outcome(pool.category, outcome.as_str());

        if let Some(m) = &self.metrics {
            m.queue_length
                .with_label_values(&[pool.category.as_str()])
                .set(pool.queue.len() as f64);
        }

        match outcome {
            PushOutcome::Queued => true,
            PushOutcome::DroppedOldest => {
                tracing::warn!(category = %pool.category, "dispatch queue full, dropped oldest job");
                true
            }
            PushOutcome::Rejected => {
                tracing::warn!(category = %pool.category, "dispatch queue full, rejected job");
                true
            }
            PushOutcome::Closed => false,
        }
    }

    fn record_outcome(&self, category: Category, outcome: &str) {
        if let Some(m) = &self.metrics {
            m.dispatch_outcomes
                .with_label_values(&[category.as_str(), outcome])
                .inc();
        }
    }
}

impl EventHandler for Dispatcher {
    async fn on_event(&self, event: &Event) -> bool {
        self.dispatch(event).await
    }

    async fn on_flow_cleanup(&self, event: Option<&Event>, eviction: &Eviction) -> bool {
        self.dispatch_eviction(event, eviction).await
    }
}

/// Worker loop: pop jobs until the queue is closed and drained.
async fn run_worker(
    category: Category,
    queue: Arc<JobQueue<Job>>,
    sink: Arc<dyn Sink>,
    metrics: Option<Arc<HealthMetrics>>,
) {
    let label = [category.as_str()];

    while let Some(job) = queue.pop().await {
        if let Some(m) = &metrics {
            m.queue_length
                .with_label_values(&label)
                .set(queue.len() as f64);
        }

        let started = Instant::now();
        let call_sink = Arc::clone(&sink);
        let result = tokio::task::spawn_blocking(move || {
            call_sink.handle(job.category, job.event, job.eviction.as_ref())
        })
        .await;

        if let Some(m) = &metrics {
            m.sink_duration
                .with_label_values(&label)
                .observe(started.elapsed().as_secs_f64());
        }

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(category = %category, sink = sink.name(), error = %e, "sink failed");
                if let Some(m) = &metrics {
                    m.sink_errors.with_label_values(&label).inc();
                }
            }
            Err(e) if e.is_panic() => {
                tracing::error!(category = %category, sink = sink.name(), "sink panicked");
                if let Some(m) = &metrics {
                    m.sink_panics.with_label_values(&label).inc();
                }
            }
            Err(e) => {
                tracing::warn!(category = %category, error = %e, "sink task cancelled");
            }
        }
    }

    tracing::debug!(category = %category, "dispatch worker stopped");
}
