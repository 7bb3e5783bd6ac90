//! Round trips and periodic polling over a bound transport.

use crate::CommError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tunnel_core::protocol::{ServiceInfo, ServiceInfoRequest};
use tunnel_core::{
    ChannelStatus, Message, Observer, PendingResponse, Transport, TransportError, decode, encode,
};

/// Shortest poll interval; shorter requests are raised to this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// What a poll schedule does when a tick comes due while the previous round
/// trip is still waiting for its response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Dispatch anyway. Several requests may be in flight at once.
    #[default]
    Concurrent,
    /// Skip the tick.
    SkipWhileOutstanding,
}

#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    /// Give up on a response after this long. `None` waits forever.
    pub request_timeout: Option<Duration>,
    pub overlap: OverlapPolicy,
    /// Drop responses that arrive after their schedule was stopped or replaced.
    pub drop_stale_responses: bool,
}

/// Performs round trips and supervises one poll schedule.
///
/// Cloning yields another handle to the same monitor.
#[derive(Clone)]
pub struct CommunicationMonitor {
    shared: Arc<Shared>,
}

/// A non-owning [`CommunicationMonitor`] handle.
#[derive(Clone)]
pub struct WeakMonitor {
    shared: Weak<Shared>,
}

impl WeakMonitor {
    pub fn upgrade(&self) -> Option<CommunicationMonitor> {
        self.shared
            .upgrade()
            .map(|shared| CommunicationMonitor { shared })
    }
}

struct Shared {
    config: MonitorConfig,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    schedule: Mutex<Option<Schedule>>,
    /// Bumped whenever a schedule starts or stops.
    generation: AtomicU64,
}

struct Schedule {
    generation: u64,
    task: JoinHandle<()>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let schedule = self
            .schedule
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(schedule) = schedule.take() {
            schedule.task.abort();
        }
    }
}

impl Shared {
    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether `generation` is the active schedule.
    fn is_current(&self, generation: u64) -> bool {
        self.schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    fn dispatch<Req: Message>(&self, message: &Req) -> Result<InFlight, CommError> {
        let transport = self.transport().ok_or(CommError::InvalidExtension)?;

        let status = transport.status();
        if !status.is_connected() {
            return Err(CommError::InvalidState(status));
        }

        let bytes = encode(message).map_err(CommError::ContainerSerialization)?;
        let sent_at = Instant::now();
        let pending = transport.send_message(bytes).map_err(|err| match err {
            TransportError::InvalidState(status) => CommError::InvalidState(status),
            other => CommError::SendFailure(other),
        })?;

        Ok(InFlight {
            request: Req::TAG,
            pending,
            sent_at,
        })
    }
}

/// A dispatched request waiting for its response.
struct InFlight {
    request: &'static str,
    pending: PendingResponse,
    sent_at: Instant,
}

impl InFlight {
    async fn response<Resp: Message>(self, timeout: Option<Duration>) -> Result<Resp, CommError> {
        let body = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.pending)
                .await
                .map_err(|_| CommError::Timeout(limit))?,
            None => self.pending.await,
        };

        let bytes = body.ok_or(CommError::NilResponse)?;
        let response = decode::<Resp>(&bytes).map_err(CommError::ResponseDecoding)?;

        tracing::debug!(
            request = self.request,
            response = Resp::TAG,
            latency_us = self.sent_at.elapsed().as_micros() as u64,
            "round trip complete"
        );
        Ok(response)
    }
}

impl CommunicationMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                transport: RwLock::new(None),
                schedule: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakMonitor {
        WeakMonitor {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.shared.config
    }

    /// Make `transport` the target of subsequent sends, replacing any previous one.
    pub fn bind(&self, transport: Arc<dyn Transport>) {
        *self
            .shared
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(transport);
    }

    pub fn unbind(&self) {
        *self
            .shared
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Status of the bound transport, if any.
    pub fn status(&self) -> Option<ChannelStatus> {
        self.shared.transport().map(|t| t.status())
    }

    /// One round trip: encode, send, wait, decode.
    pub async fn send<Req: Message, Resp: Message>(&self, message: &Req) -> Result<Resp, CommError> {
        let in_flight = self.shared.dispatch(message)?;
        in_flight
            .response(self.shared.config.request_timeout)
            .await
    }

    /// Dispatch a message and discard whatever comes back.
    pub fn post<Req: Message>(&self, message: &Req) -> Result<(), CommError> {
        self.shared.dispatch(message).map(drop)
    }

    /// Bind `transport` and poll it every `interval`, starting now.
    ///
    /// Any schedule already running on this monitor is cancelled first; once
    /// this returns, none of its ticks will dispatch. Each tick builds a fresh
    /// request and hands the round trip's result to `response_handler`. A
    /// failed tick does not stop the schedule. An `interval` below
    /// [`MIN_POLL_INTERVAL`] is raised to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_monitoring<Req, Resp, B, H>(
        &self,
        transport: Arc<dyn Transport>,
        request_builder: B,
        response_handler: H,
        interval: Duration,
    ) where
        Req: Message,
        Resp: Message,
        B: FnMut() -> Req + Send + 'static,
        H: Fn(Result<Resp, CommError>) + Send + Sync + 'static,
    {
        self.bind(transport);

        let interval = if interval < MIN_POLL_INTERVAL {
            tracing::warn!(?interval, min = ?MIN_POLL_INTERVAL, "poll interval too short, raising it");
            MIN_POLL_INTERVAL
        } else {
            interval
        };

        let mut schedule = self
            .shared
            .schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = schedule.take() {
            old.task.abort();
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let task = tokio::spawn(poll_loop::<Req, Resp, B, H>(
            Arc::downgrade(&self.shared),
            generation,
            request_builder,
            Arc::new(response_handler),
            interval,
        ));
        *schedule = Some(Schedule { generation, task });

        tracing::debug!(generation, ?interval, request = Req::TAG, "polling started");
    }

    /// Cancel the active poll schedule. Requests already in flight still
    /// complete. Does nothing when no schedule is active.
    pub fn stop_monitoring(&self) {
        let mut schedule = self
            .shared
            .schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = schedule.take() {
            old.task.abort();
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(generation = old.generation, "polling stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.shared
            .schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Poll the worker's [`ServiceInfo`] and report each answer to `observer`.
    pub fn watch_service(
        &self,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn Observer>,
        interval: Duration,
    ) {
        let mut seq = 0u64;
        self.start_monitoring(
            transport,
            move || {
                let request = ServiceInfoRequest { seq };
                seq += 1;
                request
            },
            move |result: Result<ServiceInfo, CommError>| match result {
                Ok(info) => observer.service_state_changed(&info),
                Err(err) => tracing::warn!(error = %err, "service poll failed"),
            },
            interval,
        );
    }
}

async fn poll_loop<Req, Resp, B, H>(
    shared: Weak<Shared>,
    generation: u64,
    mut request_builder: B,
    response_handler: Arc<H>,
    interval: Duration,
) where
    Req: Message,
    Resp: Message,
    B: FnMut() -> Req + Send + 'static,
    H: Fn(Result<Resp, CommError>) + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let outstanding = Arc::new(AtomicBool::new(false));

    loop {
        ticker.tick().await;

        let Some(monitor) = shared.upgrade() else {
            break;
        };
        let config = &monitor.config;

        if config.overlap == OverlapPolicy::SkipWhileOutstanding
            && outstanding.load(Ordering::SeqCst)
        {
            tracing::trace!(generation, "previous round trip outstanding, skipping tick");
            continue;
        }

        if !monitor.is_current(generation) {
            break;
        }
        // Built outside the schedule lock so the builder may call back into
        // the monitor.
        let request = request_builder();

        let dispatched = {
            let schedule = monitor
                .schedule
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if schedule.as_ref().map(|s| s.generation) != Some(generation) {
                break;
            }
            monitor.dispatch(&request)
        };

        let in_flight = match dispatched {
            Ok(in_flight) => in_flight,
            Err(err) => {
                tracing::debug!(generation, error = %err, "poll dispatch failed");
                response_handler(Err(err));
                continue;
            }
        };

        outstanding.store(true, Ordering::SeqCst);
        let timeout = config.request_timeout;
        let drop_stale = config.drop_stale_responses;
        let handler = response_handler.clone();
        let outstanding = outstanding.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            let result = in_flight.response::<Resp>(timeout).await;
            outstanding.store(false, Ordering::SeqCst);

            if drop_stale {
                let current = shared.upgrade().map(|m| m.current_generation());
                if current != Some(generation) {
                    tracing::debug!(generation, "dropping stale poll response");
                    return;
                }
            }
            handler(result);
        });
    }
}
