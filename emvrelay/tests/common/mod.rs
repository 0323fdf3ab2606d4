#![allow(dead_code)]

use log::LevelFilter;
use log4rs::{
    append::console::ConsoleAppender,
    config::{Appender, Root},
};
use std::sync::{Arc, Once};

use emvrelay::attack::{self, AttackSettings};
use emvrelay::relay::{Relay, TransportLink};
use emvrelay::scheduler::{SchedulerSettings, TimingScheduler};
use emvrelay::session::SessionSettings;
use emvrelay::{Configuration, Direction, Frame, RelayError, RelayPipeline, Result};

static LOGGING: Once = Once::new();

pub fn init_logging() {
    LOGGING.call_once(|| {
        let stdout: ConsoleAppender = ConsoleAppender::builder().build();
        let config = log4rs::config::Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(LevelFilter::Trace))
            .unwrap();
        log4rs::init_config(config).unwrap();
    });
}

pub const SELECT_PPSE: &str = "00A404000E325041592E5359532E444446303100";
pub const PPSE_RESPONSE: &str =
    "6F23840E325041592E5359532E4444463031A511BF0C0E610C4F07A00000000410108701019000";
pub const SELECT_MASTERCARD: &str = "00A4040007A000000004101000";
pub const MASTERCARD_FCI: &str = "6F1A8407A0000000041010A50F500A4D4153544552434152448701019000";
pub const GPO: &str = "80A8000002830000";
pub const MASTERCARD_GPO_RESPONSE: &str = "770A82025C009404080102009000";
pub const READ_RECORD: &str = "00B2011400";
pub const MASTERCARD_RECORD: &str = "701357115413330089010434D2512201000000000F9000";
pub const GENERATE_AC: &str = "80AE8000020000";
pub const ARQC: &str = "77149F2701809F360200429F260811223344556677889000";
pub const ONLINE_TC: &str = "77149F2701409F360200429F2608A1B2C3D4E5F607089000";

pub fn bytes(hex_data: &str) -> Vec<u8> {
    hex::decode(hex_data).unwrap()
}

/// A relay on the current runtime, so that paused time also pauses the scheduler.
pub fn relay(attacks: &AttackSettings, session: SessionSettings) -> Result<Relay> {
    init_logging();
    let configuration = Configuration::load("config/settings.yaml")?;

    let mut pipeline = RelayPipeline::new(Arc::new(configuration.kernels))
        .with_logging(Arc::new(configuration.tags), true);
    attack::install(&mut pipeline, attacks)?;

    let (scheduler, _task) = TimingScheduler::spawn(&SchedulerSettings::default());
    Ok(Relay::new(pipeline, scheduler, session))
}

pub fn no_attacks() -> AttackSettings {
    let mut attacks = AttackSettings::default();
    attacks.auth_downgrade.enabled = false;
    attacks.state_confusion.enabled = false;
    attacks.cross_kernel.enabled = false;
    attacks
}

pub async fn exchange(link: &mut TransportLink, direction: Direction, hex_data: &str) -> Result<Frame> {
    link.send(direction, bytes(hex_data)).await?;
    link.recv().await.ok_or(RelayError::TransportClosed)
}

/// SELECT PPSE through GENERATE AC, answered with an ARQC. Returns the relayed GPO
/// response.
pub async fn run_until_arqc(link: &mut TransportLink) -> Result<Frame> {
    exchange(link, Direction::TerminalToCard, SELECT_PPSE).await?;
    exchange(link, Direction::CardToTerminal, PPSE_RESPONSE).await?;
    exchange(link, Direction::TerminalToCard, SELECT_MASTERCARD).await?;
    exchange(link, Direction::CardToTerminal, MASTERCARD_FCI).await?;
    exchange(link, Direction::TerminalToCard, GPO).await?;
    let gpo_response = exchange(link, Direction::CardToTerminal, MASTERCARD_GPO_RESPONSE).await?;
    exchange(link, Direction::TerminalToCard, READ_RECORD).await?;
    exchange(link, Direction::CardToTerminal, MASTERCARD_RECORD).await?;
    exchange(link, Direction::TerminalToCard, GENERATE_AC).await?;
    exchange(link, Direction::CardToTerminal, ARQC).await?;
    Ok(gpo_response)
}
