//! Interception pipeline between the card side and the terminal side of a relay.
//!
//! Every buffer is parsed, handed to the interceptors registered for its command class
//! and direction, tracked, recorded in the session history and re-encoded. Anything
//! that goes wrong on the way results in the original bytes being forwarded.

use hexplay::HexViewBuilder;
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::apdu::{ApduMessage, CommandClass};
use crate::error::{RelayError, Result};
use crate::kernel::{KernelProfile, KernelRegistry};
use crate::scheduler::{InjectionHandle, Injection};
use crate::session::{self, ArchiveReason, EventKind, TransactionSession, TransactionState};
use crate::{tlv, Direction, TagDictionary};

mod worker;

pub use worker::{transport, Relay, RelayWorker, TransportLink, WorkerTransport};

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FrameOrigin {
    Injected,
    Relayed,
}

/// A raw buffer crossing the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub direction: Direction,
    pub data: Vec<u8>,
    pub origin: FrameOrigin,
    /// When the frame became ready to send: arrival for relayed traffic, the scheduled
    /// fire time for injections.
    pub at: Instant,
}

impl Frame {
    pub fn relayed(direction: Direction, data: Vec<u8>) -> Frame {
        Frame {
            direction,
            data,
            origin: FrameOrigin::Relayed,
            at: Instant::now(),
        }
    }
}

/// Side effects an interceptor asks for. They are applied by the pipeline and the
/// owning worker, never by the interceptor itself.
#[derive(Debug, Clone)]
pub enum InterceptRequest {
    SwitchKernel(Arc<KernelProfile>),
    Inject {
        delay: Duration,
        direction: Direction,
        payload: Vec<u8>,
        label: String,
    },
}

pub struct InterceptContext<'a> {
    pub session: &'a TransactionSession,
    pub kernels: &'a KernelRegistry,
    requests: Vec<InterceptRequest>,
}

impl<'a> InterceptContext<'a> {
    pub fn new(session: &'a TransactionSession, kernels: &'a KernelRegistry) -> InterceptContext<'a> {
        InterceptContext {
            session,
            kernels,
            requests: Vec::new(),
        }
    }

    /// Kernel the session is interpreted with, after any switch asked for earlier in
    /// this pass.
    pub fn active_kernel(&self) -> Option<&Arc<KernelProfile>> {
        self.requests
            .iter()
            .rev()
            .find_map(|request| match request {
                InterceptRequest::SwitchKernel(profile) => Some(profile),
                _ => None,
            })
            .or(self.session.active_kernel.as_ref())
    }

    /// True once an interceptor switched the kernel in this pass. The message it hands
    /// on is then shaped by the target profile.
    pub fn kernel_switched(&self) -> bool {
        self.requests
            .iter()
            .any(|request| matches!(request, InterceptRequest::SwitchKernel(_)))
    }

    pub fn switch_kernel(&mut self, profile: Arc<KernelProfile>) {
        self.requests.push(InterceptRequest::SwitchKernel(profile));
    }

    pub fn inject(&mut self, delay: Duration, direction: Direction, payload: Vec<u8>, label: &str) {
        self.requests.push(InterceptRequest::Inject {
            delay,
            direction,
            payload,
            label: label.to_string(),
        });
    }

    pub fn requests(&self) -> &[InterceptRequest] {
        &self.requests[..]
    }
}

pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the message to forward, `message` itself for no change. An error
    /// aborts the whole pass and the original bytes are forwarded.
    fn intercept(&self, message: ApduMessage, context: &mut InterceptContext) -> Result<ApduMessage>;
}

/// Adapts a closure into an [`Interceptor`].
pub struct FnInterceptor<F> {
    name: String,
    function: F,
}

impl<F> FnInterceptor<F>
where
    F: Fn(ApduMessage, &mut InterceptContext) -> Result<ApduMessage> + Send + Sync,
{
    pub fn new(name: &str, function: F) -> FnInterceptor<F> {
        FnInterceptor {
            name: name.to_string(),
            function,
        }
    }
}

impl<F> Interceptor for FnInterceptor<F>
where
    F: Fn(ApduMessage, &mut InterceptContext) -> Result<ApduMessage> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn intercept(&self, message: ApduMessage, context: &mut InterceptContext) -> Result<ApduMessage> {
        (self.function)(message, context)
    }
}

struct Registration {
    command_class: CommandClass,
    direction: Direction,
    interceptor: Arc<dyn Interceptor>,
}

/// Result of one pass through the pipeline.
#[derive(Debug, Clone)]
pub struct Forwarded {
    /// Bytes for onward transport.
    pub bytes: Vec<u8>,
    /// Injections to hand to the timing scheduler.
    pub injections: Vec<Injection>,
    /// Pending injections of a session that just got archived.
    pub cancelled: Vec<InjectionHandle>,
}

impl Forwarded {
    fn unchanged(raw: &[u8]) -> Forwarded {
        Forwarded {
            bytes: raw.to_vec(),
            injections: Vec::new(),
            cancelled: Vec::new(),
        }
    }
}

pub struct RelayPipeline {
    kernels: Arc<KernelRegistry>,
    registrations: Vec<Registration>,
    tags: Option<Arc<TagDictionary>>,
    censor: bool,
}

impl RelayPipeline {
    pub fn new(kernels: Arc<KernelRegistry>) -> RelayPipeline {
        RelayPipeline {
            kernels,
            registrations: Vec::new(),
            tags: None,
            censor: true,
        }
    }

    /// Enables decoded tree logging with names from `tags`.
    pub fn with_logging(mut self, tags: Arc<TagDictionary>, censor: bool) -> RelayPipeline {
        self.tags = Some(tags);
        self.censor = censor;
        self
    }

    pub fn kernels(&self) -> &KernelRegistry {
        &self.kernels
    }

    /// Interceptors run in registration order. `Other` traffic is never intercepted.
    pub fn register(
        &mut self,
        command_class: CommandClass,
        direction: Direction,
        interceptor: Arc<dyn Interceptor>,
    ) -> Result<()> {
        if command_class == CommandClass::Other {
            return Err(RelayError::Configuration(format!(
                "{} cannot intercept unclassified traffic",
                interceptor.name()
            )));
        }

        debug!(
            "Registered {} for {:?} {:?}",
            interceptor.name(),
            command_class,
            direction
        );
        self.registrations.push(Registration {
            command_class,
            direction,
            interceptor,
        });
        Ok(())
    }

    pub fn interceptor_names(&self, command_class: CommandClass, direction: Direction) -> Vec<&str> {
        self.interceptors(command_class, direction)
            .map(|i| i.name())
            .collect()
    }

    fn interceptors(
        &self,
        command_class: CommandClass,
        direction: Direction,
    ) -> impl Iterator<Item = &Arc<dyn Interceptor>> {
        self.registrations
            .iter()
            .filter(move |r| r.command_class == command_class && r.direction == direction)
            .map(|r| &r.interceptor)
    }

    fn log_buffer(&self, label: &str, direction: Direction, data: &[u8]) {
        if self.censor {
            debug!(
                "{} {:?}: {:02X?}... ({} bytes)",
                label,
                direction,
                &data[..data.len().min(5)],
                data.len()
            );
        } else {
            trace!(
                "{} {:?}:\n{}",
                label,
                direction,
                HexViewBuilder::new(data).finish()
            );
        }
    }

    fn parse(&self, raw: &[u8], direction: Direction, session: &TransactionSession) -> Result<ApduMessage> {
        let message = match direction {
            Direction::TerminalToCard => ApduMessage::parse_command(raw)?,
            Direction::CardToTerminal => ApduMessage::parse_response(raw, session.last_command)?,
        };

        if let Some(tags) = &self.tags {
            tlv::log_tree(message.body(), tags, self.censor);
        }
        Ok(message)
    }

    /// Decodes `raw`, runs the interceptors registered for it, advances the tracker and
    /// records the outcome in `session`'s history.
    pub fn forward(&self, raw: &[u8], direction: Direction, session: &mut TransactionSession) -> Forwarded {
        self.log_buffer("Relaying", direction, raw);

        let message = match self.parse(raw, direction, session) {
            Ok(message) => message,
            Err(e) => {
                warn!("Passing through unparseable {:?} buffer: {}", direction, e);
                let mut event = session.event(EventKind::PassedThrough);
                event.direction = Some(direction);
                event.origin = Some(FrameOrigin::Relayed);
                event.detail = Some(e.to_string());
                session.history.push(event);
                return Forwarded::unchanged(raw);
            }
        };

        if direction == Direction::TerminalToCard {
            session.last_command = Some(message.command_class());
            if message.command_class() == CommandClass::Select {
                self.resolve_kernel(&message, session);
            }
        }

        // an archived session is only observed, its traffic is never rewritten
        let intercepted = if session.is_live() {
            self.intercept(&message, session)
        } else {
            trace!(
                "Session {} archived as {:?}, relaying unmodified",
                session.session_id,
                session.archived
            );
            Ok((message.clone(), Vec::new(), Vec::new()))
        };

        let (outgoing, transforms, requests) = match intercepted {
            Ok(result) => result,
            Err(e) => {
                error!("{}, forwarding original message", e);
                session.record_anomaly(EventKind::InterceptorFailed, e.to_string());
                (message.clone(), Vec::new(), Vec::new())
            }
        };

        let mut forwarded = Forwarded::unchanged(raw);
        for request in requests {
            match request {
                InterceptRequest::SwitchKernel(profile) => {
                    debug!(
                        "Session {} now interpreted as {}",
                        session.session_id, profile.scheme_id
                    );
                    session.active_kernel = Some(profile);
                }
                InterceptRequest::Inject {
                    delay,
                    direction,
                    payload,
                    label,
                } => forwarded.injections.push(Injection {
                    session_id: session.session_id,
                    direction,
                    payload,
                    delay,
                    label,
                }),
            }
        }

        let kind = if message.command_class() == CommandClass::Other {
            EventKind::PassedThrough
        } else {
            EventKind::Forwarded
        };
        forwarded.cancelled = self.track(&outgoing, FrameOrigin::Relayed, kind, transforms, session);

        // synthesized replacements are not marked modified, compare the wire bytes
        forwarded.bytes = outgoing.to_bytes();
        if forwarded.bytes != raw {
            self.log_buffer("Modified", direction, &forwarded.bytes);
        }
        forwarded
    }

    /// Accepts a fired injection for `session`. Returns the bytes to send, or `None`
    /// when the session is archived and the injection has to be dropped.
    pub fn accept_injection(
        &self,
        handle: InjectionHandle,
        injection: &Injection,
        session: &mut TransactionSession,
    ) -> Option<Forwarded> {
        session.pending_injections.retain(|p| p.handle != handle);

        if !session.is_live() {
            info!(
                "Dropping {} for archived session {}",
                injection.label, session.session_id
            );
            let mut event = session.event(EventKind::InjectionDropped);
            event.direction = Some(injection.direction);
            event.origin = Some(FrameOrigin::Injected);
            event.transform_applied = vec![injection.label.clone()];
            event.detail = Some(format!("session archived as {:?}", session.archived));
            session.history.push(event);
            return None;
        }

        self.log_buffer("Injecting", injection.direction, &injection.payload);

        let mut forwarded = Forwarded::unchanged(&injection.payload);
        match self.parse(&injection.payload, injection.direction, session) {
            Ok(message) => {
                forwarded.cancelled = self.track(
                    &message,
                    FrameOrigin::Injected,
                    EventKind::Injected,
                    vec![injection.label.clone()],
                    session,
                );
            }
            Err(e) => {
                warn!("Injected payload of {} does not parse: {}", injection.label, e);
                let mut event = session.event(EventKind::Injected);
                event.direction = Some(injection.direction);
                event.origin = Some(FrameOrigin::Injected);
                event.transform_applied = vec![injection.label.clone()];
                event.detail = Some(e.to_string());
                session.history.push(event);
            }
        }

        Some(forwarded)
    }

    fn resolve_kernel(&self, message: &ApduMessage, session: &mut TransactionSession) {
        let aid = match message.aid() {
            Some(aid) => aid,
            None => return,
        };

        match self.kernels.resolve(aid) {
            Ok(profile) => {
                debug!(
                    "Session {}: AID {} selects {}",
                    session.session_id,
                    hex::encode_upper(aid),
                    profile.scheme_id
                );
                session.active_kernel = Some(profile);
            }
            // PPSE and unknown applications are relayed generically
            Err(e) => trace!("Session {}: {}", session.session_id, e),
        }
    }

    #[allow(clippy::type_complexity)]
    fn intercept(
        &self,
        message: &ApduMessage,
        session: &TransactionSession,
    ) -> Result<(ApduMessage, Vec<String>, Vec<InterceptRequest>)> {
        let mut current = message.clone();
        let mut transforms = Vec::new();
        let mut context = InterceptContext::new(session, &self.kernels);

        if message.command_class() == CommandClass::Other {
            return Ok((current, transforms, context.requests));
        }

        for interceptor in self.interceptors(message.command_class(), message.direction()) {
            let before = context.requests.len();
            let next = interceptor
                .intercept(current.clone(), &mut context)
                .map_err(|e| RelayError::InterceptorFailed {
                    interceptor: interceptor.name().to_string(),
                    reason: e.to_string(),
                })?;

            if next.direction() != message.direction() {
                return Err(RelayError::InterceptorFailed {
                    interceptor: interceptor.name().to_string(),
                    reason: "changed the message direction".to_string(),
                });
            }

            if next.to_bytes() != current.to_bytes() || context.requests.len() != before {
                trace!("{} applied to {:?}", interceptor.name(), message.command_class());
                transforms.push(interceptor.name().to_string());
            }
            current = next;
        }

        Ok((current, transforms, context.requests))
    }

    fn track(
        &self,
        message: &ApduMessage,
        origin: FrameOrigin,
        kind: EventKind,
        transforms: Vec<String>,
        session: &mut TransactionSession,
    ) -> Vec<InjectionHandle> {
        session.observe_identifiers(message);

        let tracked = session::observe(message, origin, session);
        if let Some(tracker_event) = tracked {
            session::advance(session, tracker_event);
        }

        let mut event = session.event(kind);
        event.direction = Some(message.direction());
        event.command_class = Some(message.command_class());
        event.origin = Some(origin);
        event.transform_applied = transforms;
        event.source = match tracked {
            Some(session::TrackerEvent::AuthorizationGranted(source)) => Some(source),
            _ => None,
        };
        session.history.push(event);

        match session.state {
            TransactionState::Authorized if session.is_live() => session.archive(ArchiveReason::Authorized),
            TransactionState::Declined if session.is_live() => session.archive(ArchiveReason::Declined),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::test_registry;
    use crate::session::AuthorizationSource;
    use crate::tlv::tags;

    fn pipeline() -> RelayPipeline {
        crate::testing::init_logging();
        RelayPipeline::new(Arc::new(test_registry()))
    }

    fn bytes(s: &str) -> Vec<u8> {
        hex::decode(s.replace(' ', "")).unwrap()
    }

    const SELECT_MASTERCARD: &str = "00A4040007A000000004101000";
    const GPO: &str = "80A8000002830000";
    const GPO_RESPONSE: &str = "770A82025C00940408010200 9000";

    #[test]
    fn test_identity_forwarding_keeps_bytes() {
        let pipeline = pipeline();
        let mut session = TransactionSession::new(1);

        let select = bytes(SELECT_MASTERCARD);
        let forwarded = pipeline.forward(&select, Direction::TerminalToCard, &mut session);
        assert_eq!(forwarded.bytes, select);
        assert_eq!(session.state, TransactionState::CardPresent);
        assert_eq!(
            session.active_kernel.as_ref().map(|k| k.scheme_id.as_str()),
            Some("mastercard")
        );
        assert_eq!(session.history.len(), 1);
        assert_eq!(session.history[0].kind, EventKind::Forwarded);
    }

    #[test]
    fn test_interceptors_run_in_registration_order() -> Result<()> {
        let mut pipeline = pipeline();
        pipeline.register(
            CommandClass::Gpo,
            Direction::CardToTerminal,
            Arc::new(FnInterceptor::new("first", |m: ApduMessage, _: &mut InterceptContext| {
                m.with(tags::AIP, vec![0x20, 0x00])
            })),
        )?;
        pipeline.register(
            CommandClass::Gpo,
            Direction::CardToTerminal,
            Arc::new(FnInterceptor::new("second", |m: ApduMessage, _: &mut InterceptContext| {
                // sees the output of the first one
                assert_eq!(m.value(tags::AIP), Some(&[0x20, 0x00][..]));
                m.with(tags::AIP, vec![0x40, 0x00])
            })),
        )?;
        pipeline.register(
            CommandClass::Gpo,
            Direction::CardToTerminal,
            Arc::new(FnInterceptor::new("identity", |m: ApduMessage, _: &mut InterceptContext| Ok(m))),
        )?;

        let mut session = TransactionSession::new(1);
        session.last_command = Some(CommandClass::Gpo);
        let forwarded = pipeline.forward(&bytes(GPO_RESPONSE), Direction::CardToTerminal, &mut session);

        assert_eq!(forwarded.bytes, bytes("770A82024000940408010200 9000"));
        let event = session.history.last().unwrap();
        assert_eq!(event.transform_applied, vec!["first", "second"]);
        assert_eq!(event.command_class, Some(CommandClass::Gpo));
        Ok(())
    }

    #[test]
    fn test_failing_interceptor_forwards_original() -> Result<()> {
        let mut pipeline = pipeline();
        pipeline.register(
            CommandClass::Gpo,
            Direction::CardToTerminal,
            Arc::new(FnInterceptor::new("rewrite", |m: ApduMessage, c: &mut InterceptContext| {
                c.inject(Duration::from_millis(5), Direction::CardToTerminal, vec![0x90, 0x00], "never");
                m.with(tags::AIP, vec![0x40, 0x00])
            })),
        )?;
        pipeline.register(
            CommandClass::Gpo,
            Direction::CardToTerminal,
            Arc::new(FnInterceptor::new("broken", |_: ApduMessage, _: &mut InterceptContext| {
                Err(RelayError::MalformedApdu("boom".to_string()))
            })),
        )?;

        let mut session = TransactionSession::new(1);
        session.last_command = Some(CommandClass::Gpo);
        let raw = bytes(GPO_RESPONSE);
        let forwarded = pipeline.forward(&raw, Direction::CardToTerminal, &mut session);

        assert_eq!(forwarded.bytes, raw);
        assert!(forwarded.injections.is_empty());
        assert!(session
            .history
            .iter()
            .any(|e| e.kind == EventKind::InterceptorFailed
                && e.detail.as_deref().map_or(false, |d| d.contains("broken"))));
        Ok(())
    }

    #[test]
    fn test_malformed_buffers_pass_through() -> Result<()> {
        let mut pipeline = pipeline();
        pipeline.register(
            CommandClass::Gpo,
            Direction::CardToTerminal,
            Arc::new(FnInterceptor::new("unreachable", |_: ApduMessage, _: &mut InterceptContext| {
                Err(RelayError::MalformedApdu("should not run".to_string()))
            })),
        )?;

        let mut session = TransactionSession::new(1);
        session.last_command = Some(CommandClass::Gpo);
        // AFL length overruns the template
        let raw = bytes("770A8202198094090801010090 00");
        let forwarded = pipeline.forward(&raw, Direction::CardToTerminal, &mut session);

        assert_eq!(forwarded.bytes, raw);
        assert_eq!(session.history[0].kind, EventKind::PassedThrough);
        assert_eq!(session.state, TransactionState::Idle);
        Ok(())
    }

    #[test]
    fn test_other_traffic_is_not_intercepted() {
        let mut pipeline = pipeline();
        assert!(pipeline
            .register(
                CommandClass::Other,
                Direction::TerminalToCard,
                Arc::new(FnInterceptor::new("nope", |m: ApduMessage, _: &mut InterceptContext| Ok(m))),
            )
            .is_err());

        let mut session = TransactionSession::new(1);
        let get_data = bytes("80CA9F3600");
        let forwarded = pipeline.forward(&get_data, Direction::TerminalToCard, &mut session);
        assert_eq!(forwarded.bytes, get_data);
        assert_eq!(session.history[0].kind, EventKind::PassedThrough);
    }

    #[test]
    fn test_injection_requests_and_kernel_switch() -> Result<()> {
        let mut pipeline = pipeline();
        pipeline.register(
            CommandClass::Gpo,
            Direction::TerminalToCard,
            Arc::new(FnInterceptor::new("switch", |m: ApduMessage, c: &mut InterceptContext| {
                let visa = c.kernels.get("visa")?;
                c.switch_kernel(visa);
                assert_eq!(c.active_kernel().map(|k| k.scheme_id.as_str()), Some("visa"));
                c.inject(Duration::from_millis(15), Direction::CardToTerminal, vec![0x90, 0x00], "probe");
                Ok(m)
            })),
        )?;

        let mut session = TransactionSession::new(3);
        pipeline.forward(&bytes(SELECT_MASTERCARD), Direction::TerminalToCard, &mut session);
        let forwarded = pipeline.forward(&bytes(GPO), Direction::TerminalToCard, &mut session);

        assert_eq!(forwarded.bytes, bytes(GPO));
        assert_eq!(forwarded.injections.len(), 1);
        assert_eq!(forwarded.injections[0].session_id, 3);
        assert_eq!(forwarded.injections[0].delay, Duration::from_millis(15));
        assert_eq!(
            session.active_kernel.as_ref().map(|k| k.scheme_id.as_str()),
            Some("visa")
        );
        assert_eq!(session.history.last().unwrap().transform_applied, vec!["switch"]);
        Ok(())
    }

    #[test]
    fn test_terminal_response_archives_session() {
        let pipeline = pipeline();
        let mut session = TransactionSession::new(1);
        session.state = TransactionState::AppSelected;
        session.last_command = Some(CommandClass::GenerateAc);

        let tc = bytes("77149F2701409F360200429F26081122334455667788 9000");
        let forwarded = pipeline.forward(&tc, Direction::CardToTerminal, &mut session);
        assert_eq!(forwarded.bytes, tc);
        assert_eq!(session.state, TransactionState::Authorized);
        assert!(!session.is_live());
        assert_eq!(session.authorizations, vec![AuthorizationSource::Offline]);
        assert_eq!(session.atc, Some(0x0042));
    }

    #[test]
    fn test_archived_session_is_relayed_unmodified() -> Result<()> {
        let mut pipeline = pipeline();
        pipeline.register(
            CommandClass::Gpo,
            Direction::CardToTerminal,
            Arc::new(crate::attack::AuthDowngrade::new(crate::kernel::AuthMethod::Sda)),
        )?;

        let mut session = TransactionSession::new(4);
        session.state = TransactionState::AppSelected;
        session.active_kernel = Some(test_registry().get("mastercard")?);
        session.last_command = Some(CommandClass::Gpo);
        session.archive(ArchiveReason::Conflict);

        let raw = bytes(GPO_RESPONSE);
        let forwarded = pipeline.forward(&raw, Direction::CardToTerminal, &mut session);

        assert_eq!(forwarded.bytes, raw);
        assert!(forwarded.injections.is_empty());
        assert_eq!(session.archived, Some(ArchiveReason::Conflict));
        let event = session.history.last().unwrap();
        assert_eq!(event.kind, EventKind::Forwarded);
        assert!(event.transform_applied.is_empty());
        Ok(())
    }

    #[test]
    fn test_injection_dropped_for_archived_session() {
        let pipeline = pipeline();
        let mut session = TransactionSession::new(1);
        session.state = TransactionState::Declined;
        session.archive(ArchiveReason::Declined);

        let injection = Injection {
            session_id: 1,
            direction: Direction::CardToTerminal,
            payload: bytes("77149F2701409F360200429F26081122334455667788 9000"),
            delay: Duration::from_millis(15),
            label: "forged TC".to_string(),
        };
        let handle = serde_yaml::from_str("9").unwrap();
        assert!(pipeline.accept_injection(handle, &injection, &mut session).is_none());
        assert_eq!(session.state, TransactionState::Declined);
        assert_eq!(
            session.history.last().map(|e| e.kind),
            Some(EventKind::InjectionDropped)
        );
    }
}
