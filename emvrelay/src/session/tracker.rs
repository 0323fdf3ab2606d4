//! Shadow of the terminal's transaction state, inferred from the traffic the relay
//! sees. The tracker cannot ask the terminal anything; an event that does not fit the
//! table is recorded, never rejected.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{EventKind, TransactionSession};
use crate::apdu::{ApduMessage, CommandClass};
use crate::error::RelayError;
use crate::relay::FrameOrigin;
use crate::{CryptogramType, Direction};

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Idle,
    CardPresent,
    AppSelected,
    PendingAuth,
    Authorized,
    Declined,
}

impl TransactionState {
    pub const ALL: [TransactionState; 6] = [
        TransactionState::Idle,
        TransactionState::CardPresent,
        TransactionState::AppSelected,
        TransactionState::PendingAuth,
        TransactionState::Authorized,
        TransactionState::Declined,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Authorized | TransactionState::Declined)
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AuthorizationSource {
    /// TC following an ARQC, i.e. after the issuer was asked.
    Online,
    /// TC without an online round trip, or one the relay injected.
    Offline,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TrackerEvent {
    SelectIssued,
    ApplicationSelected,
    ProcessingOptions,
    RecordRead,
    AuthorizationRequested,
    AuthorizationGranted(AuthorizationSource),
    AuthorizationDeclined,
}

use AuthorizationSource::{Offline, Online};
use TrackerEvent::*;
use TransactionState::*;

/// Every valid `(from, event, to)` step. Anything else is an unexpected transition.
pub const TRANSITIONS: &[(TransactionState, TrackerEvent, TransactionState)] = &[
    (Idle, SelectIssued, CardPresent),
    (CardPresent, SelectIssued, CardPresent),
    (CardPresent, ApplicationSelected, AppSelected),
    // PPSE first, then the application itself
    (AppSelected, SelectIssued, CardPresent),
    (AppSelected, ProcessingOptions, AppSelected),
    (AppSelected, RecordRead, AppSelected),
    (AppSelected, AuthorizationRequested, PendingAuth),
    (AppSelected, AuthorizationGranted(Offline), Authorized),
    (AppSelected, AuthorizationDeclined, Declined),
    (PendingAuth, AuthorizationGranted(Online), Authorized),
    (PendingAuth, AuthorizationGranted(Offline), Authorized),
    (PendingAuth, AuthorizationDeclined, Declined),
];

pub fn transition(from: TransactionState, event: TrackerEvent) -> Option<TransactionState> {
    TRANSITIONS
        .iter()
        .find(|(state, on, _)| *state == from && *on == event)
        .map(|(_, _, to)| *to)
}

/// Maps a message to the tracker event it stands for, if any. Only `90 00`
/// responses move the state forward.
pub fn observe(
    message: &ApduMessage,
    origin: FrameOrigin,
    session: &TransactionSession,
) -> Option<TrackerEvent> {
    if message.direction() == Direction::TerminalToCard {
        return match message.command_class() {
            CommandClass::Select => Some(SelectIssued),
            _ => None,
        };
    }

    if !message.is_success() {
        return None;
    }

    match message.command_class() {
        CommandClass::Select => Some(ApplicationSelected),
        CommandClass::Gpo => Some(ProcessingOptions),
        CommandClass::ReadRecord => Some(RecordRead),
        CommandClass::GenerateAc => match message.cryptogram_type()? {
            CryptogramType::AuthorisationRequestCryptogram => Some(AuthorizationRequested),
            CryptogramType::TransactionCertificate => {
                let source = if origin == FrameOrigin::Injected || !session.online_requested {
                    Offline
                } else {
                    Online
                };
                Some(AuthorizationGranted(source))
            }
            CryptogramType::ApplicationAuthenticationCryptogram => Some(AuthorizationDeclined),
        },
        CommandClass::Other => None,
    }
}

/// Applies `event` to the session's private copy and returns the resulting state.
pub fn advance(session: &mut TransactionSession, event: TrackerEvent) -> TransactionState {
    match event {
        AuthorizationRequested => session.online_requested = true,
        AuthorizationGranted(source) => {
            session.authorizations.push(source);
            let dual = session.authorizations.contains(&Online)
                && session.authorizations.contains(&Offline);
            if dual && !session.dual_authorization_detected {
                warn!(
                    "Session {} authorized both online and offline",
                    session.session_id
                );
                session.dual_authorization_detected = true;
            }
        }
        _ => (),
    }

    let from = session.state;
    match transition(from, event) {
        Some(to) => {
            if to != from {
                debug!("Session {}: {:?} -> {:?}", session.session_id, from, to);
            }
            session.state = to;
        }
        None => {
            let anomaly = RelayError::UnexpectedTransition { from, event };
            info!("Session {}: {}", session.session_id, anomaly);
            session.unexpected_transitions += 1;
            session.record_anomaly(EventKind::UnexpectedTransition, anomaly.to_string());
        }
    }

    session.state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TransactionSession;

    fn parse_response(hex_data: &str, class: CommandClass) -> ApduMessage {
        ApduMessage::parse_response(&hex::decode(hex_data).unwrap(), Some(class)).unwrap()
    }

    const ARQC: &str = "77149F2701809F360200429F260811223344556677889000";
    const TC: &str = "77149F2701409F360200429F260811223344556677889000";

    #[test]
    fn test_transition_table() {
        assert_eq!(transition(Idle, SelectIssued), Some(CardPresent));
        assert_eq!(transition(AppSelected, ProcessingOptions), Some(AppSelected));
        assert_eq!(transition(PendingAuth, AuthorizationGranted(Online)), Some(Authorized));
        assert_eq!(transition(AppSelected, AuthorizationGranted(Online)), None);
        assert_eq!(transition(Authorized, AuthorizationGranted(Online)), None);

        // terminal states have no way out
        for (from, _, _) in TRANSITIONS {
            assert!(!from.is_terminal());
        }
    }

    #[test]
    fn test_full_online_flow() {
        let mut session = TransactionSession::new(1);
        for event in [
            SelectIssued,
            ApplicationSelected,
            ProcessingOptions,
            RecordRead,
            AuthorizationRequested,
            AuthorizationGranted(Online),
        ] {
            advance(&mut session, event);
        }

        assert_eq!(session.state, Authorized);
        assert_eq!(session.unexpected_transitions, 0);
        assert!(!session.dual_authorization_detected);
    }

    #[test]
    fn test_dual_authorization_is_flagged() {
        let mut session = TransactionSession::new(1);
        session.state = PendingAuth;
        session.online_requested = true;

        assert_eq!(advance(&mut session, AuthorizationGranted(Offline)), Authorized);
        assert!(!session.dual_authorization_detected);

        // second authorization has nowhere to go but is still counted
        assert_eq!(advance(&mut session, AuthorizationGranted(Online)), Authorized);
        assert!(session.dual_authorization_detected);
        assert_eq!(session.unexpected_transitions, 1);
        assert_eq!(session.authorizations, vec![Offline, Online]);
        assert_eq!(
            session.history.last().map(|e| e.kind),
            Some(EventKind::UnexpectedTransition)
        );
    }

    #[test]
    fn test_observe_sources() {
        let mut session = TransactionSession::new(1);
        session.state = AppSelected;

        let arqc = parse_response(ARQC, CommandClass::GenerateAc);
        let tc = parse_response(TC, CommandClass::GenerateAc);

        // TC straight after selection is an offline approval
        assert_eq!(
            observe(&tc, FrameOrigin::Relayed, &session),
            Some(AuthorizationGranted(Offline))
        );
        assert_eq!(
            observe(&arqc, FrameOrigin::Relayed, &session),
            Some(AuthorizationRequested)
        );

        advance(&mut session, AuthorizationRequested);
        assert_eq!(
            observe(&tc, FrameOrigin::Relayed, &session),
            Some(AuthorizationGranted(Online))
        );
        assert_eq!(
            observe(&tc, FrameOrigin::Injected, &session),
            Some(AuthorizationGranted(Offline))
        );

        let failed = parse_response("6985", CommandClass::GenerateAc);
        assert_eq!(observe(&failed, FrameOrigin::Relayed, &session), None);
    }
}
