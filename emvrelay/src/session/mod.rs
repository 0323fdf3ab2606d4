use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::apdu::{ApduMessage, CommandClass};
use crate::bcdutil;
use crate::error::{RelayError, Result};
use crate::kernel::KernelProfile;
use crate::relay::FrameOrigin;
use crate::scheduler::InjectionHandle;
use crate::tlv::tags;
use crate::{get_truncated_pan, Direction, Track2};

mod tracker;

pub use tracker::{
    advance, observe, transition, AuthorizationSource, TrackerEvent, TransactionState,
    TRANSITIONS,
};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionSettings {
    /// A session without traffic for this long is archived.
    pub idle_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            idle_timeout_ms: 5000,
        }
    }
}

impl SessionSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventKind {
    Forwarded,
    /// Unparseable or unknown traffic sent on untouched.
    PassedThrough,
    Injected,
    InjectionDropped,
    TimingBudgetExceeded,
    UnexpectedTransition,
    InterceptorFailed,
    SessionConflict,
    Archived,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct HistoryEvent {
    pub timestamp: DateTime<Utc>,
    /// Microseconds since the session was opened, on the relay's monotonic clock.
    pub elapsed_us: u64,
    pub kind: EventKind,
    pub direction: Option<Direction>,
    pub command_class: Option<CommandClass>,
    pub origin: Option<FrameOrigin>,
    pub transform_applied: Vec<String>,
    pub resulting_state: TransactionState,
    pub source: Option<AuthorizationSource>,
    pub detail: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArchiveReason {
    Authorized,
    Declined,
    Timeout,
    /// A new transaction started before this one finished.
    Abandoned,
    Conflict,
    Shutdown,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PendingInjection {
    pub handle: InjectionHandle,
    pub label: String,
    pub direction: Direction,
    pub delay_ms: u64,
}

fn serialize_pan<S: Serializer>(pan: &Option<String>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match pan {
        Some(pan) => serializer.serialize_some(&get_truncated_pan(pan)),
        None => serializer.serialize_none(),
    }
}

fn serialize_kernel<S: Serializer>(
    kernel: &Option<Arc<KernelProfile>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match kernel {
        Some(profile) => serializer.serialize_some(&profile.scheme_id),
        None => serializer.serialize_none(),
    }
}

/// One card/terminal transaction as seen by the relay. Owned and mutated by a single
/// relay worker; everybody else reads published snapshots.
#[derive(Serialize, Debug, Clone)]
pub struct TransactionSession {
    pub session_id: u64,
    #[serde(serialize_with = "serialize_pan")]
    pub pan: Option<String>,
    pub atc: Option<u16>,
    #[serde(skip)]
    pub track2: Option<Track2>,
    pub state: TransactionState,
    #[serde(serialize_with = "serialize_kernel")]
    pub active_kernel: Option<Arc<KernelProfile>>,
    pub pending_injections: Vec<PendingInjection>,
    pub history: Vec<HistoryEvent>,
    pub authorizations: Vec<AuthorizationSource>,
    pub online_requested: bool,
    pub dual_authorization_detected: bool,
    pub timing_unreliable: bool,
    pub unexpected_transitions: u32,
    pub last_command: Option<CommandClass>,
    pub archived: Option<ArchiveReason>,
    #[serde(skip)]
    opened_at: Instant,
}

impl TransactionSession {
    pub fn new(session_id: u64) -> TransactionSession {
        TransactionSession {
            session_id,
            pan: None,
            atc: None,
            track2: None,
            state: TransactionState::Idle,
            active_kernel: None,
            pending_injections: Vec::new(),
            history: Vec::new(),
            authorizations: Vec::new(),
            online_requested: false,
            dual_authorization_detected: false,
            timing_unreliable: false,
            unexpected_transitions: 0,
            last_command: None,
            archived: None,
            opened_at: Instant::now(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.archived.is_none()
    }

    pub fn card_identifier(&self) -> Option<(&str, u16)> {
        Some((self.pan.as_deref()?, self.atc?))
    }

    /// Picks up PAN (5A, else track 2) and ATC (9F36) from card responses. Returns
    /// true when this message completed the card identifier pair.
    pub fn observe_identifiers(&mut self, message: &ApduMessage) -> bool {
        if message.direction() != Direction::CardToTerminal {
            return false;
        }
        let was_complete = self.card_identifier().is_some();

        if let Some(track2) = message.value(tags::TRACK2).and_then(Track2::from_icc) {
            if self.pan.is_none() {
                self.pan = Some(track2.primary_account_number.clone());
            }
            self.track2 = Some(track2);
        }
        if let Some(pan) = message.value(tags::PAN).and_then(bcdutil::pan_from_bcd) {
            self.pan = Some(pan);
        }
        if let Some(atc) = message.atc() {
            if self.atc.map_or(false, |known| known != atc) {
                debug!(
                    "Session {}: ATC changed from {:04X} to {:04X}",
                    self.session_id,
                    self.atc.unwrap_or_default(),
                    atc
                );
            }
            self.atc = Some(atc);
        }

        !was_complete && self.card_identifier().is_some()
    }

    pub fn event(&self, kind: EventKind) -> HistoryEvent {
        HistoryEvent {
            timestamp: Utc::now(),
            elapsed_us: self.opened_at.elapsed().as_micros() as u64,
            kind,
            direction: None,
            command_class: None,
            origin: None,
            transform_applied: Vec::new(),
            resulting_state: self.state,
            source: None,
            detail: None,
        }
    }

    pub fn record_anomaly(&mut self, kind: EventKind, detail: String) {
        let mut event = self.event(kind);
        event.detail = Some(detail);
        self.history.push(event);
    }

    /// Marks the session archived and hands back the injections to cancel.
    pub fn archive(&mut self, reason: ArchiveReason) -> Vec<InjectionHandle> {
        if self.archived.is_some() {
            return Vec::new();
        }

        info!(
            "Session {} archived ({:?}) in state {:?}",
            self.session_id, reason, self.state
        );
        self.archived = Some(reason);

        let mut event = self.event(EventKind::Archived);
        event.detail = Some(format!("{:?}", reason));
        self.history.push(event);

        self.pending_injections.drain(..).map(|p| p.handle).collect()
    }

    pub fn authorization_sources(&self) -> Vec<AuthorizationSource> {
        self.history.iter().filter_map(|e| e.source).collect()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    sessions: HashMap<u64, Arc<TransactionSession>>,
    live_cards: HashMap<(String, u16), u64>,
}

/// Published session snapshots. Readers always see a whole session as some worker
/// last published it.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    pub fn open(&self) -> TransactionSession {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = TransactionSession::new(session_id);

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.sessions.insert(session_id, Arc::new(session.clone()));
        debug!("Opened session {}", session_id);

        session
    }

    /// Replaces the published snapshot of `session` as a whole. A live session whose
    /// card identifier belongs to another live session is refused with
    /// `SessionConflict`; the caller must end it.
    pub fn publish(&self, session: &TransactionSession) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        if let Some((pan, atc)) = session.card_identifier() {
            let key = (pan.to_string(), atc);
            match state.live_cards.get(&key).copied() {
                Some(owner) if owner != session.session_id && session.is_live() => {
                    let owner_live = state
                        .sessions
                        .get(&owner)
                        .map_or(false, |s| s.is_live());
                    if owner_live {
                        warn!(
                            "Session {} conflicts with live session {} for {} / {:04X}",
                            session.session_id,
                            owner,
                            get_truncated_pan(pan),
                            atc
                        );
                        return Err(RelayError::SessionConflict {
                            pan: get_truncated_pan(pan),
                            atc,
                        });
                    }
                    state.live_cards.insert(key, session.session_id);
                }
                Some(owner) if owner == session.session_id && !session.is_live() => {
                    state.live_cards.remove(&key);
                }
                None if session.is_live() => {
                    state.live_cards.insert(key, session.session_id);
                }
                _ => (),
            }
        }

        state
            .sessions
            .insert(session.session_id, Arc::new(session.clone()));
        Ok(())
    }

    pub fn snapshot(&self, session_id: u64) -> Option<Arc<TransactionSession>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.sessions.get(&session_id).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<TransactionSession>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut sessions: Vec<Arc<TransactionSession>> = state.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.session_id);
        sessions
    }

    pub fn live_sessions(&self) -> Vec<Arc<TransactionSession>> {
        self.sessions().into_iter().filter(|s| s.is_live()).collect()
    }
}
