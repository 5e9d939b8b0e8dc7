//! Fan-out dispatcher: one inbound request, one copy per registered backend.
//!
//! The first backend of the snapshot is the primary. Its delivery runs inside
//! the caller's future, so a disconnecting caller cancels it, and its outcome
//! becomes the caller's response. Every other backend gets its own spawned
//! task that runs to completion or timeout regardless of the caller. Their
//! failures are logged and counted, never propagated.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::forward::{self, DeliveryError, InboundRequest, UpstreamResponse};
use crate::stats::ProxyStats;

/// Which backend of a dispatch a delivery belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Background,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => f.write_str("primary"),
            Role::Background => f.write_str("background"),
        }
    }
}

/// Outcome of delivering one copy to one backend.
#[derive(Debug)]
pub struct DeliveryReport {
    pub backend: String,
    pub role: Role,
    pub latency: Duration,
    pub outcome: Result<UpstreamResponse, DeliveryError>,
}

impl DeliveryReport {
    pub fn is_delivered(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Result of [`Dispatcher::dispatch`].
#[derive(Debug)]
pub enum Dispatch {
    /// The snapshot was empty; nothing was sent anywhere.
    NoBackends,
    Delivered {
        primary: DeliveryReport,
        background: BackgroundDeliveries,
    },
}

impl Dispatch {
    /// Number of backends a copy was sent to.
    pub fn attempted(&self) -> usize {
        match self {
            Dispatch::NoBackends => 0,
            Dispatch::Delivered { background, .. } => 1 + background.len(),
        }
    }
}

/// Handles to the non-primary deliveries of one dispatch.
///
/// Dropping this detaches the tasks; they keep running.
#[derive(Debug, Default)]
pub struct BackgroundDeliveries {
    handles: Vec<JoinHandle<DeliveryReport>>,
}

impl BackgroundDeliveries {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every background delivery and collect the reports.
    pub async fn join(self) -> Vec<DeliveryReport> {
        let mut reports = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!(error = %e, "Background delivery task failed"),
            }
        }
        reports
    }
}

/// Count of background deliveries that have not finished yet.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard(self.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Broadcasts requests to backend snapshots. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    timeout: Duration,
    stats: ProxyStats,
    in_flight: Arc<InFlight>,
}

impl Dispatcher {
    /// Create a new dispatcher.
    ///
    /// `timeout` bounds each delivery on its own; no backend ever waits on
    /// another backend's delivery.
    pub fn new(client: reqwest::Client, timeout: Duration, stats: ProxyStats) -> Self {
        Self {
            client,
            timeout,
            stats,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Send a copy of `request` to every backend in `snapshot`.
    ///
    /// Background deliveries are spawned before the primary is awaited, so
    /// all copies leave together. Only the primary is waited on.
    pub async fn dispatch(
        &self,
        request: InboundRequest,
        snapshot: Vec<String>,
        correlation_id: &str,
    ) -> Dispatch {
        let mut backends = snapshot.into_iter();
        let Some(primary) = backends.next() else {
            self.stats.inc_requests_without_backends();
            tracing::debug!("No backends registered, nothing dispatched");
            return Dispatch::NoBackends;
        };

        let started = Instant::now();
        let request = Arc::new(request);
        let handles = backends
            .map(|backend| {
                self.spawn_background(backend, request.clone(), correlation_id, started)
            })
            .collect();

        let primary = self
            .deliver(
                primary,
                Role::Primary,
                request,
                correlation_id.to_string(),
                started,
            )
            .await;

        Dispatch::Delivered {
            primary,
            background: BackgroundDeliveries { handles },
        }
    }

    /// Number of background deliveries still running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Wait up to `deadline` for all background deliveries to finish.
    ///
    /// Returns `false` if some were still running when the deadline passed.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let wait_idle = async {
            loop {
                let idle = self.in_flight.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(deadline, wait_idle).await.is_ok()
    }

    fn spawn_background(
        &self,
        backend: String,
        request: Arc<InboundRequest>,
        correlation_id: &str,
        started: Instant,
    ) -> JoinHandle<DeliveryReport> {
        let guard = self.in_flight.enter();
        let delivery = self.deliver(
            backend,
            Role::Background,
            request,
            correlation_id.to_string(),
            started,
        );

        tokio::spawn(async move {
            let _guard = guard;
            delivery.await
        })
    }

    /// Build the future delivering one copy to `backend`.
    ///
    /// The span is created here, in the caller's context, so background
    /// deliveries stay children of the inbound request span. Latency is
    /// measured from `started`, the moment the dispatch began.
    fn deliver(
        &self,
        backend: String,
        role: Role,
        request: Arc<InboundRequest>,
        correlation_id: String,
        started: Instant,
    ) -> impl Future<Output = DeliveryReport> + Send + 'static {
        let span = spray_tracing::backend_delivery_span!(correlation_id, backend, role);
        let client = self.client.clone();
        let stats = self.stats.clone();
        let timeout = self.timeout;

        async move {
            stats.inc_attempted();

            let outcome =
                forward::deliver(&client, &backend, &request, &correlation_id, timeout).await;

            let latency = started.elapsed();
            let latency_ms = latency.as_millis() as u64;
            tracing::Span::current().record("latency_ms", latency_ms);
            stats.record_outcome(outcome.is_ok());

            match &outcome {
                Ok(resp) => {
                    tracing::Span::current().record("status", resp.status.as_u16());
                    tracing::info!(
                        backend = %backend,
                        role = %role,
                        status = resp.status.as_u16(),
                        latency_ms = latency_ms,
                        "Delivery complete"
                    );
                }
                Err(e) => {
                    tracing::Span::current().record("status", e.status().as_u16());
                    tracing::warn!(
                        error = %e,
                        backend = %backend,
                        role = %role,
                        latency_ms = latency_ms,
                        "Delivery failed"
                    );
                }
            }

            DeliveryReport {
                backend,
                role,
                latency,
                outcome,
            }
        }
        .instrument(span)
    }
}
