use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use super::{Forwarded, Frame, FrameOrigin, RelayPipeline};
use crate::apdu::{ApduMessage, CommandClass};
use crate::attack;
use crate::error::{RelayError, Result};
use crate::scheduler::{FiredInjection, TimingScheduler};
use crate::session::{
    ArchiveReason, EventKind, PendingInjection, SessionRegistry, SessionSettings,
    TransactionSession, TransactionState,
};
use crate::{Configuration, Direction};

/// Worker end of a relay link.
pub struct WorkerTransport {
    inbound: mpsc::Receiver<Frame>,
    outbound: mpsc::Sender<Frame>,
}

/// Radio end of a relay link: frames received from either party go in, frames to
/// transmit come out.
pub struct TransportLink {
    to_relay: mpsc::Sender<Frame>,
    from_relay: mpsc::Receiver<Frame>,
}

impl TransportLink {
    pub async fn send(&self, direction: Direction, data: Vec<u8>) -> Result<()> {
        self.to_relay
            .send(Frame::relayed(direction, data))
            .await
            .map_err(|_| RelayError::TransportClosed)
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_relay.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.from_relay.try_recv().ok()
    }
}

pub fn transport(capacity: usize) -> (WorkerTransport, TransportLink) {
    let (to_relay, inbound) = mpsc::channel(capacity);
    let (outbound, from_relay) = mpsc::channel(capacity);

    (
        WorkerTransport { inbound, outbound },
        TransportLink {
            to_relay,
            from_relay,
        },
    )
}

enum Ready {
    Frame(Frame),
    Injection(FiredInjection),
}

impl Ready {
    fn order_key(&self) -> (Instant, FrameOrigin) {
        match self {
            Ready::Frame(frame) => (frame.at, frame.origin),
            Ready::Injection(fired) => (fired.deadline, FrameOrigin::Injected),
        }
    }
}

// earlier first; on a tie the injection goes out before relayed traffic
fn outbound_order(ready: &mut [Ready]) {
    ready.sort_by_key(Ready::order_key);
}

fn starts_transaction(data: &[u8]) -> bool {
    ApduMessage::parse_command(data).map_or(false, |m| m.command_class() == CommandClass::Select)
}

/// Owns the session of one relay link and is the only writer of it.
pub struct RelayWorker {
    pipeline: Arc<RelayPipeline>,
    scheduler: TimingScheduler,
    sessions: Arc<SessionRegistry>,
    settings: SessionSettings,
    transport: WorkerTransport,
    shutdown: watch::Receiver<bool>,
    fired_tx: UnboundedSender<FiredInjection>,
    fired_rx: UnboundedReceiver<FiredInjection>,
    current: Option<TransactionSession>,
    last_activity: Instant,
}

impl RelayWorker {
    pub fn new(
        pipeline: Arc<RelayPipeline>,
        scheduler: TimingScheduler,
        sessions: Arc<SessionRegistry>,
        settings: SessionSettings,
        transport: WorkerTransport,
        shutdown: watch::Receiver<bool>,
    ) -> RelayWorker {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();

        RelayWorker {
            pipeline,
            scheduler,
            sessions,
            settings,
            transport,
            shutdown,
            fired_tx,
            fired_rx,
            current: None,
            last_activity: Instant::now(),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> Result<()> {
        debug!("Relay worker started");
        let mut ready: Vec<Ready> = Vec::new();

        let result = 'relay: loop {
            let idle_deadline = self.last_activity + self.settings.idle_timeout();
            let live = self.current.as_ref().map_or(false, |s| s.is_live());

            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break Ok(());
                    }
                    continue;
                }

                Some(fired) = self.fired_rx.recv() => ready.push(Ready::Injection(fired)),

                frame = self.transport.inbound.recv() => match frame {
                    Some(frame) => ready.push(Ready::Frame(frame)),
                    None => {
                        debug!("Transport closed");
                        break Ok(());
                    }
                },

                _ = sleep_until(idle_deadline), if live => {
                    debug!("No traffic for {:?}", self.settings.idle_timeout());
                    self.end_session(ArchiveReason::Timeout);
                    continue;
                }
            }

            // whatever else is already due competes for the same slot
            while let Ok(fired) = self.fired_rx.try_recv() {
                ready.push(Ready::Injection(fired));
            }
            while let Ok(frame) = self.transport.inbound.try_recv() {
                ready.push(Ready::Frame(frame));
            }
            outbound_order(&mut ready);

            for item in ready.drain(..) {
                let handled = match item {
                    Ready::Frame(frame) => self.relay_frame(frame).await,
                    Ready::Injection(fired) => self.inject(fired).await,
                };
                if let Err(e) = handled {
                    break 'relay Err(e);
                }
            }
        };

        self.end_session(ArchiveReason::Shutdown);
        match &result {
            Ok(()) => debug!("Relay worker stopped"),
            Err(e) => warn!("Relay worker stopped: {}", e),
        }
        result
    }

    async fn relay_frame(&mut self, frame: Frame) -> Result<()> {
        self.last_activity = Instant::now();

        if frame.direction == Direction::TerminalToCard && starts_transaction(&frame.data) {
            self.begin_session();
        }

        let data = match self.current.as_mut() {
            Some(session) => {
                let forwarded = self.pipeline.forward(&frame.data, frame.direction, session);
                self.settle(forwarded)
            }
            None => {
                trace!("No transaction yet, relaying {:?} untracked", frame.direction);
                frame.data
            }
        };

        self.send(Frame {
            direction: frame.direction,
            data,
            origin: FrameOrigin::Relayed,
            at: frame.at,
        })
        .await
    }

    async fn inject(&mut self, fired: FiredInjection) -> Result<()> {
        let tolerance = self.scheduler.tolerance();
        let session = match self.current.as_mut() {
            Some(session) if session.session_id == fired.injection.session_id => session,
            _ => {
                self.drop_stale(&fired);
                return Ok(());
            }
        };

        if let Err(e) = fired.check(tolerance) {
            warn!("Session {}: {}", session.session_id, e);
            session.timing_unreliable = true;
            session.record_anomaly(EventKind::TimingBudgetExceeded, e.to_string());
        }

        match self
            .pipeline
            .accept_injection(fired.handle, &fired.injection, session)
        {
            Some(forwarded) => {
                let data = self.settle(forwarded);
                self.send(Frame {
                    direction: fired.injection.direction,
                    data,
                    origin: FrameOrigin::Injected,
                    at: fired.deadline,
                })
                .await
            }
            None => {
                self.publish();
                Ok(())
            }
        }
    }

    // the session it belonged to was replaced, record the drop on its snapshot
    fn drop_stale(&self, fired: &FiredInjection) {
        let snapshot = match self.sessions.snapshot(fired.injection.session_id) {
            Some(snapshot) if !snapshot.is_live() => snapshot,
            _ => {
                warn!(
                    "Injection {} for unknown session {}",
                    fired.handle.id(),
                    fired.injection.session_id
                );
                return;
            }
        };

        let mut session = TransactionSession::clone(&snapshot);
        self.pipeline
            .accept_injection(fired.handle, &fired.injection, &mut session);
        if let Err(e) = self.sessions.publish(&session) {
            error!("Could not publish session {}: {}", session.session_id, e);
        }
    }

    fn settle(&mut self, forwarded: Forwarded) -> Vec<u8> {
        let Forwarded {
            bytes,
            injections,
            cancelled,
        } = forwarded;

        if let Some(session) = self.current.as_mut() {
            for handle in cancelled {
                if let Err(e) = self.scheduler.cancel(handle) {
                    warn!("Could not cancel injection {}: {}", handle.id(), e);
                }
            }

            for injection in injections {
                if !session.is_live() {
                    let mut event = session.event(EventKind::InjectionDropped);
                    event.transform_applied = vec![injection.label.clone()];
                    event.detail = Some("requested after the session ended".to_string());
                    session.history.push(event);
                    continue;
                }

                let label = injection.label.clone();
                let direction = injection.direction;
                let delay_ms = injection.delay.as_millis() as u64;
                match self.scheduler.schedule(injection, self.fired_tx.clone()) {
                    Ok(handle) => session.pending_injections.push(PendingInjection {
                        handle,
                        label,
                        direction,
                        delay_ms,
                    }),
                    Err(e) => {
                        error!("Session {}: {} not scheduled: {}", session.session_id, label, e);
                        session.record_anomaly(EventKind::InjectionDropped, e.to_string());
                    }
                }
            }
        }

        self.publish();
        bytes
    }

    fn begin_session(&mut self) {
        if let Some(session) = self.current.as_ref() {
            let early = matches!(
                session.state,
                TransactionState::Idle | TransactionState::CardPresent | TransactionState::AppSelected
            );
            // PPSE then application selection is still the same transaction
            if session.is_live() && early {
                return;
            }
        }

        self.end_session(ArchiveReason::Abandoned);
        let session = self.sessions.open();
        info!("Session {} started", session.session_id);
        self.current = Some(session);
    }

    fn end_session(&mut self, reason: ArchiveReason) {
        let session = match self.current.as_mut() {
            Some(session) if session.is_live() => session,
            _ => return,
        };

        session.archive(reason);
        if let Err(e) = self.scheduler.cancel_session(session.session_id) {
            debug!("Session {}: {}", session.session_id, e);
        }
        self.publish();
    }

    /// Publishes the current session. A conflicting card identifier ends it.
    fn publish(&mut self) {
        let session = match self.current.as_mut() {
            Some(session) => session,
            None => return,
        };

        if let Err(e) = self.sessions.publish(session) {
            session.record_anomaly(EventKind::SessionConflict, e.to_string());
            session.archive(ArchiveReason::Conflict);
            if let Err(e) = self.scheduler.cancel_session(session.session_id) {
                debug!("Session {}: {}", session.session_id, e);
            }

            if let Err(e) = self.sessions.publish(session) {
                error!("Could not publish session {}: {}", session.session_id, e);
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.transport
            .outbound
            .send(frame)
            .await
            .map_err(|_| RelayError::TransportClosed)
    }
}

/// A running relay: one pipeline and timing authority shared by any number of links.
pub struct Relay {
    pipeline: Arc<RelayPipeline>,
    scheduler: TimingScheduler,
    timing_thread: Option<thread::JoinHandle<()>>,
    sessions: Arc<SessionRegistry>,
    settings: SessionSettings,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<Result<()>>>,
}

impl Relay {
    /// Builds the pipeline with the configured attacks and starts the timing
    /// authority on its own thread.
    pub fn start(configuration: Configuration) -> Result<Relay> {
        let Configuration {
            settings,
            tags,
            kernels,
        } = configuration;

        let mut pipeline = RelayPipeline::new(Arc::new(kernels))
            .with_logging(Arc::new(tags), settings.censor_sensitive_fields);
        attack::install(&mut pipeline, &settings.attacks)?;

        let (scheduler, timing_thread) = TimingScheduler::start_dedicated(&settings.scheduler)?;
        let mut relay = Relay::new(pipeline, scheduler, settings.session);
        relay.timing_thread = Some(timing_thread);
        Ok(relay)
    }

    /// Uses an already running scheduler, e.g. one spawned on the caller's runtime.
    pub fn new(pipeline: RelayPipeline, scheduler: TimingScheduler, settings: SessionSettings) -> Relay {
        let (shutdown, _) = watch::channel(false);

        Relay {
            pipeline: Arc::new(pipeline),
            scheduler,
            timing_thread: None,
            sessions: Arc::new(SessionRegistry::new()),
            settings,
            shutdown,
            workers: Vec::new(),
        }
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        self.sessions.clone()
    }

    pub fn pipeline(&self) -> &RelayPipeline {
        &self.pipeline
    }

    /// Spawns a worker for a new link and returns its radio end.
    pub fn connect(&mut self, capacity: usize) -> TransportLink {
        let (worker_end, link) = transport(capacity);
        let worker = RelayWorker::new(
            self.pipeline.clone(),
            self.scheduler.clone(),
            self.sessions.clone(),
            self.settings.clone(),
            worker_end,
            self.shutdown.subscribe(),
        );
        self.workers.push(worker.spawn());
        link
    }

    /// Archives every live session, cancels pending injections and stops the workers
    /// and the timing authority.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down relay");
        // no receivers left only means no worker is running
        let _ = self.shutdown.send(true);

        let mut result = Ok(());
        for worker in self.workers.drain(..) {
            match worker.await {
                Ok(Ok(())) => (),
                Ok(Err(RelayError::TransportClosed)) => debug!("Worker lost its transport"),
                Ok(Err(e)) => result = Err(e),
                Err(e) => error!("Relay worker panicked: {}", e),
            }
        }

        if let Err(e) = self.scheduler.shutdown() {
            debug!("{}", e);
        }
        if let Some(timing_thread) = self.timing_thread.take() {
            tokio::task::spawn_blocking(move || timing_thread.join())
                .await
                .map_err(|_| RelayError::SchedulerUnavailable)?
                .map_err(|_| RelayError::SchedulerUnavailable)?;
        }

        result
    }
}
