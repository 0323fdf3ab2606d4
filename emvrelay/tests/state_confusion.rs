mod common;

use std::time::Duration;

use common::*;
use emvrelay::session::{ArchiveReason, AuthorizationSource, EventKind, SessionSettings};
use emvrelay::{CryptogramType, Direction, FrameOrigin, Result, TransactionState};

fn race(delay_ms: u64) -> emvrelay::attack::AttackSettings {
    let mut attacks = no_attacks();
    attacks.state_confusion.enabled = true;
    attacks.state_confusion.delay_ms = delay_ms;
    attacks
}

#[tokio::test(start_paused = true)]
async fn test_forged_tc_wins_the_race() -> Result<()> {
    let mut relay = relay(&race(15), SessionSettings::default())?;
    let sessions = relay.sessions();
    let mut link = relay.connect(16);

    run_until_arqc(&mut link).await?;
    let arqc_relayed_at = tokio::time::Instant::now();

    // the issuer takes 30 ms, the forged TC is due after 15
    tokio::time::sleep(Duration::from_millis(30)).await;
    link.send(Direction::CardToTerminal, bytes(ONLINE_TC)).await?;

    let first = link.recv().await.ok_or(emvrelay::RelayError::TransportClosed)?;
    let second = link.recv().await.ok_or(emvrelay::RelayError::TransportClosed)?;

    assert_eq!(first.origin, FrameOrigin::Injected);
    assert_eq!(first.direction, Direction::CardToTerminal);
    assert_eq!(first.at - arqc_relayed_at, Duration::from_millis(15));
    let forged = emvrelay::ApduMessage::parse_response(
        &first.data,
        Some(emvrelay::CommandClass::GenerateAc),
    )?;
    assert_eq!(
        forged.cryptogram_type(),
        Some(CryptogramType::TransactionCertificate)
    );
    assert_eq!(forged.atc(), Some(0x0042));

    assert_eq!(second.origin, FrameOrigin::Relayed);
    assert_eq!(second.data, bytes(ONLINE_TC));
    assert!(first.at < second.at);

    let session = sessions.sessions().pop().unwrap();
    assert_eq!(session.state, TransactionState::Authorized);
    assert_eq!(session.archived, Some(ArchiveReason::Authorized));
    assert_eq!(
        session.authorization_sources(),
        vec![AuthorizationSource::Offline, AuthorizationSource::Online]
    );
    assert!(session.dual_authorization_detected);
    assert_eq!(session.unexpected_transitions, 1);
    assert!(!session.timing_unreliable);
    assert!(session.pending_injections.is_empty());

    let injected: Vec<_> = session
        .history
        .iter()
        .filter(|e| e.kind == EventKind::Injected)
        .collect();
    assert_eq!(injected.len(), 1);
    assert_eq!(injected[0].transform_applied, vec!["state_confusion"]);
    assert_eq!(injected[0].origin, Some(FrameOrigin::Injected));

    // history is in acceptance order
    assert!(session
        .history
        .windows(2)
        .all(|pair| pair[0].elapsed_us <= pair[1].elapsed_us));

    relay.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn test_late_injection_is_cancelled() -> Result<()> {
    let mut relay = relay(&race(50), SessionSettings::default())?;
    let sessions = relay.sessions();
    let mut link = relay.connect(16);

    run_until_arqc(&mut link).await?;
    tokio::time::sleep(Duration::from_millis(30)).await;
    let tc = exchange(&mut link, Direction::CardToTerminal, ONLINE_TC).await?;
    assert_eq!(tc.origin, FrameOrigin::Relayed);

    // well past the injection's deadline
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(link.try_recv().is_none());

    let session = sessions.sessions().pop().unwrap();
    assert_eq!(session.state, TransactionState::Authorized);
    assert_eq!(session.archived, Some(ArchiveReason::Authorized));
    assert_eq!(
        session.authorization_sources(),
        vec![AuthorizationSource::Online]
    );
    assert!(!session.dual_authorization_detected);
    assert!(session.history.iter().all(|e| e.kind != EventKind::Injected));

    relay.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn test_declined_transaction_gets_no_injection() -> Result<()> {
    let mut relay = relay(&race(15), SessionSettings::default())?;
    let sessions = relay.sessions();
    let mut link = relay.connect(16);

    run_until_arqc(&mut link).await?;
    // issuer declines within the window
    exchange(
        &mut link,
        Direction::CardToTerminal,
        "77149F2701009F360200429F260811223344556677889000",
    )
    .await?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(link.try_recv().is_none());

    let session = sessions.sessions().pop().unwrap();
    assert_eq!(session.state, TransactionState::Declined);
    assert_eq!(session.archived, Some(ArchiveReason::Declined));
    assert!(session.authorizations.is_empty());

    relay.shutdown().await
}
