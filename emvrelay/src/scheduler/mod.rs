//! Timing authority for injected responses.
//!
//! The scheduler owns every pending injection and fires it on its own timeline; it
//! never touches session state. A fired injection is sent back over the channel given
//! at scheduling time and the owning relay worker merges it into its outbound traffic.

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::error::{RelayError, Result};
use crate::Direction;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SchedulerSettings {
    /// Allowed lateness of a fired injection before the run is marked unreliable.
    pub tolerance_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings { tolerance_ms: 2 }
    }
}

impl SchedulerSettings {
    pub fn tolerance(&self) -> Duration {
        Duration::from_millis(self.tolerance_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InjectionHandle(u64);

impl InjectionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A deferred injection as handed to the scheduler.
#[derive(Debug, Clone)]
pub struct Injection {
    pub session_id: u64,
    pub direction: Direction,
    pub payload: Vec<u8>,
    pub delay: Duration,
    /// Which transform asked for it.
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct FiredInjection {
    pub handle: InjectionHandle,
    pub injection: Injection,
    pub deadline: Instant,
    pub fired_at: Instant,
}

impl FiredInjection {
    pub fn lateness(&self) -> Duration {
        self.fired_at.saturating_duration_since(self.deadline)
    }

    /// `TimingBudgetExceeded` when the timer fired later than `tolerance` allows.
    pub fn check(&self, tolerance: Duration) -> Result<()> {
        let lateness = self.lateness();
        if lateness > tolerance {
            return Err(RelayError::TimingBudgetExceeded {
                requested: self.injection.delay,
                lateness,
                tolerance,
            });
        }

        Ok(())
    }
}

enum Command {
    Schedule {
        handle: InjectionHandle,
        injection: Injection,
        deadline: Instant,
        reply: UnboundedSender<FiredInjection>,
    },
    Cancel(InjectionHandle),
    CancelSession(u64),
    Shutdown,
}

struct Entry {
    injection: Injection,
    deadline: Instant,
    reply: UnboundedSender<FiredInjection>,
}

/// Cheap to clone; every clone talks to the same timing loop.
#[derive(Debug, Clone)]
pub struct TimingScheduler {
    commands: UnboundedSender<Command>,
    next_handle: Arc<AtomicU64>,
    tolerance: Duration,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Command::Schedule { handle, .. } => write!(f, "Schedule({})", handle.0),
            Command::Cancel(handle) => write!(f, "Cancel({})", handle.0),
            Command::CancelSession(session_id) => write!(f, "CancelSession({})", session_id),
            Command::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl TimingScheduler {
    fn channel(settings: &SchedulerSettings) -> (TimingScheduler, UnboundedReceiver<Command>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        (
            TimingScheduler {
                commands,
                next_handle: Arc::new(AtomicU64::new(1)),
                tolerance: settings.tolerance(),
            },
            receiver,
        )
    }

    /// Runs the timing loop as a task on the current tokio runtime.
    pub fn spawn(settings: &SchedulerSettings) -> (TimingScheduler, JoinHandle<()>) {
        let (scheduler, receiver) = TimingScheduler::channel(settings);
        let task = tokio::spawn(run(receiver));
        (scheduler, task)
    }

    /// Runs the timing loop on its own OS thread with a current-thread runtime, so that
    /// timers keep firing however busy the forwarding runtime is.
    pub fn start_dedicated(
        settings: &SchedulerSettings,
    ) -> Result<(TimingScheduler, thread::JoinHandle<()>)> {
        let (scheduler, receiver) = TimingScheduler::channel(settings);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| {
                warn!("Could not build timing runtime: {}", e);
                RelayError::SchedulerUnavailable
            })?;

        let thread = thread::Builder::new()
            .name("timing-authority".to_string())
            .spawn(move || runtime.block_on(run(receiver)))
            .map_err(|e| {
                warn!("Could not start timing thread: {}", e);
                RelayError::SchedulerUnavailable
            })?;

        Ok((scheduler, thread))
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Enqueues `injection` to fire `injection.delay` from now. The fired injection is
    /// delivered on `reply`.
    pub fn schedule(
        &self,
        injection: Injection,
        reply: UnboundedSender<FiredInjection>,
    ) -> Result<InjectionHandle> {
        let handle = InjectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + injection.delay;

        trace!(
            "Scheduling injection {} ({}) for session {} in {:?}",
            handle.0,
            injection.label,
            injection.session_id,
            injection.delay
        );

        self.commands
            .send(Command::Schedule {
                handle,
                injection,
                deadline,
                reply,
            })
            .map_err(|_| RelayError::SchedulerUnavailable)?;

        Ok(handle)
    }

    /// Removes the injection if it has not fired yet.
    pub fn cancel(&self, handle: InjectionHandle) -> Result<()> {
        self.send(Command::Cancel(handle))
    }

    pub fn cancel_session(&self, session_id: u64) -> Result<()> {
        self.send(Command::CancelSession(session_id))
    }

    /// Drops every pending injection and stops the timing loop.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| RelayError::SchedulerUnavailable)
    }
}

async fn run(mut commands: UnboundedReceiver<Command>) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, InjectionHandle)>> = BinaryHeap::new();
    let mut entries: HashMap<InjectionHandle, Entry> = HashMap::new();

    debug!("Timing scheduler started");

    loop {
        // cancelled entries stay in the heap until they surface
        while let Some(Reverse((_, handle))) = deadlines.peek().copied() {
            if entries.contains_key(&handle) {
                break;
            }
            deadlines.pop();
        }

        let next_deadline = deadlines.peek().map(|Reverse((deadline, _))| *deadline);
        let wake_at = next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(Command::Schedule { handle, injection, deadline, reply }) => {
                    deadlines.push(Reverse((deadline, handle)));
                    entries.insert(handle, Entry { injection, deadline, reply });
                }
                Some(Command::Cancel(handle)) => {
                    if entries.remove(&handle).is_some() {
                        debug!("Cancelled injection {}", handle.0);
                    }
                }
                Some(Command::CancelSession(session_id)) => {
                    let before = entries.len();
                    entries.retain(|_, entry| entry.injection.session_id != session_id);
                    if before != entries.len() {
                        debug!(
                            "Cancelled {} injections of session {}",
                            before - entries.len(),
                            session_id
                        );
                    }
                }
                Some(Command::Shutdown) | None => break,
            },

            _ = sleep_until(wake_at), if next_deadline.is_some() => {
                fire_due(&mut deadlines, &mut entries);
            }
        }
    }

    if !entries.is_empty() {
        info!(
            "Timing scheduler stopped with {} pending injections dropped",
            entries.len()
        );
    } else {
        debug!("Timing scheduler stopped");
    }
}

fn fire_due(
    deadlines: &mut BinaryHeap<Reverse<(Instant, InjectionHandle)>>,
    entries: &mut HashMap<InjectionHandle, Entry>,
) {
    let now = Instant::now();

    while let Some(Reverse((deadline, handle))) = deadlines.peek().copied() {
        if deadline > now {
            break;
        }
        deadlines.pop();

        let entry = match entries.remove(&handle) {
            Some(entry) => entry,
            None => continue,
        };

        let fired = FiredInjection {
            handle,
            injection: entry.injection,
            deadline: entry.deadline,
            fired_at: now,
        };
        trace!(
            "Injection {} fired {:?} after its deadline",
            handle.0,
            fired.lateness()
        );

        if entry.reply.send(fired).is_err() {
            debug!("Owner of injection {} is gone, dropping it", handle.0);
        }
    }
}
