use clap::{Parser, ValueEnum};
use log::{debug, error, info, warn, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use emvrelay::attack::FormalModel;
use emvrelay::relay::{Relay, TransportLink};
use emvrelay::{Configuration, Direction, Frame, FrameOrigin, RelayError, Settings};

#[derive(ValueEnum, Debug, Copy, Clone, PartialEq, Eq)]
enum Attack {
    AuthDowngrade,
    StateConfusion,
    CrossKernel,
}

#[derive(Parser, Debug)]
#[command(version, about = "Replays a card/terminal APDU transcript through the EMV relay core")]
struct Args {
    /// Transcript to replay
    #[arg(short, long, default_value = "transcripts/mastercard_online.yaml")]
    transcript: String,

    #[arg(long, default_value = "../emvrelay/config/settings.yaml")]
    settings: String,

    #[arg(long, default_value = "../emvrelay/config/log4rs.yaml")]
    log_config: String,

    /// Enables an attack on top of the settings file
    #[arg(short, long, value_enum)]
    attack: Vec<Attack>,

    /// Disables every attack, including those enabled in the settings file
    #[arg(long)]
    passive: bool,

    /// Prints the recorded session history as YAML
    #[arg(long)]
    history: bool,

    /// Prints the tracker transition table and attack triggers as YAML and exits
    #[arg(long)]
    export_model: bool,
}

/// One exchange on the wire. A step without a command delivers a card response the
/// terminal did not ask for again, e.g. the issuer's answer after an ARQC.
#[derive(Deserialize, Debug)]
struct Step {
    command: Option<String>,
    /// Time the card (or the issuer behind the terminal) takes to answer
    #[serde(default)]
    delay_ms: u64,
    response: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Transcript {
    name: String,
    steps: Vec<Step>,
}

fn init_logging(log_config: &str) {
    if let Err(err) = log4rs::init_file(log_config, Default::default()) {
        let stdout: ConsoleAppender = ConsoleAppender::builder().build();
        let config = Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(LevelFilter::Info));

        match config {
            Ok(config) => {
                if log4rs::init_config(config).is_ok() {
                    warn!("Could not load {}: {}, logging to console", log_config, err);
                }
            }
            Err(err) => eprintln!("Logging unavailable: {}", err),
        }
    }
}

fn print_frame(frame: &Frame) {
    let arrow = match frame.direction {
        Direction::TerminalToCard => "terminal -> card",
        Direction::CardToTerminal => "card -> terminal",
    };
    let origin = match frame.origin {
        FrameOrigin::Injected => " [injected]",
        FrameOrigin::Relayed => "",
    };
    info!("{}{}: {}", arrow, origin, hex::encode_upper(&frame.data));
}

fn decode(hex_data: &str) -> Result<Vec<u8>, String> {
    hex::decode(hex_data.replace(' ', "")).map_err(|e| format!("transcript: {}: {}", hex_data, e))
}

/// Sends one buffer and prints everything the relay transmits until that buffer
/// comes out on the other side.
async fn exchange(link: &mut TransportLink, direction: Direction, data: Vec<u8>) -> Result<(), String> {
    link.send(direction, data).await.map_err(|e| e.to_string())?;

    loop {
        let frame = link
            .recv()
            .await
            .ok_or_else(|| RelayError::TransportClosed.to_string())?;
        print_frame(&frame);
        if frame.origin == FrameOrigin::Relayed && frame.direction == direction {
            return Ok(());
        }
    }
}

async fn replay(link: &mut TransportLink, transcript: &Transcript, grace: Duration) -> Result<(), String> {
    info!("Replaying {} ({} steps)", transcript.name, transcript.steps.len());

    for step in &transcript.steps {
        if let Some(command) = &step.command {
            exchange(link, Direction::TerminalToCard, decode(command)?).await?;
        }
        if step.delay_ms > 0 {
            sleep(Duration::from_millis(step.delay_ms)).await;
        }
        if let Some(response) = &step.response {
            exchange(link, Direction::CardToTerminal, decode(response)?).await?;
        }
    }

    // injections still in flight
    while let Ok(Some(frame)) = timeout(grace, link.recv()).await {
        print_frame(&frame);
    }

    Ok(())
}

/// Configuration file paths in the settings are relative to the crate holding the
/// `config/` directory, i.e. the parent of the settings file's directory.
fn rebase_configuration_files(settings: &mut Settings, settings_file: &str) {
    let base = match Path::new(settings_file).parent().and_then(Path::parent) {
        Some(base) => base,
        None => return,
    };

    for file in [
        &mut settings.configuration_files.emv_tags,
        &mut settings.configuration_files.kernels,
    ] {
        if Path::new(file.as_str()).is_relative() {
            let rebased = base.join(file.as_str()).to_string_lossy().to_string();
            debug!("Configuration file {} resolved to {}", file, rebased);
            *file = rebased;
        }
    }
}

fn apply_attack_arguments(settings: &mut Settings, args: &Args) {
    let attacks = &mut settings.attacks;
    if args.passive {
        attacks.auth_downgrade.enabled = false;
        attacks.state_confusion.enabled = false;
        attacks.cross_kernel.enabled = false;
    }

    for attack in &args.attack {
        match attack {
            Attack::AuthDowngrade => attacks.auth_downgrade.enabled = true,
            Attack::StateConfusion => attacks.state_confusion.enabled = true,
            Attack::CrossKernel => attacks.cross_kernel.enabled = true,
        }
    }
}

async fn run() -> Result<Option<String>, String> {
    let args = Args::parse();
    init_logging(&args.log_config);

    if args.export_model {
        let model = FormalModel::derive().to_yaml().map_err(|e| e.to_string())?;
        println!("{}", model);
        return Ok(None);
    }

    let mut settings = Settings::load(&args.settings).map_err(|e| e.to_string())?;
    rebase_configuration_files(&mut settings, &args.settings);
    apply_attack_arguments(&mut settings, &args);
    debug!("Attacks: {:?}", settings.attacks);
    let grace = Duration::from_millis(settings.attacks.state_confusion.delay_ms + 100);

    let transcript: Transcript = serde_yaml::from_str(
        &fs::read_to_string(&args.transcript).map_err(|e| format!("{}: {}", args.transcript, e))?,
    )
    .map_err(|e| format!("{}: {}", args.transcript, e))?;

    let configuration = Configuration::from_settings(settings).map_err(|e| e.to_string())?;
    let mut relay = Relay::start(configuration).map_err(|e| e.to_string())?;
    let sessions = relay.sessions();
    let mut link = relay.connect(32);

    let replayed = replay(&mut link, &transcript, grace).await;
    relay.shutdown().await.map_err(|e| e.to_string())?;
    replayed?;

    let mut findings = Vec::new();
    for session in sessions.sessions() {
        info!(
            "Session {}: {:?}, archived {:?}, {} events, {} unexpected transitions",
            session.session_id,
            session.state,
            session.archived,
            session.history.len(),
            session.unexpected_transitions
        );
        if session.dual_authorization_detected {
            findings.push(format!(
                "session {} was authorized both online and offline",
                session.session_id
            ));
        }
        if session.timing_unreliable {
            findings.push(format!(
                "session {} missed its timing budget, results are unreliable",
                session.session_id
            ));
        }

        if args.history {
            println!(
                "{}",
                serde_yaml::to_string(&*session).map_err(|e| e.to_string())?
            );
        }
    }

    if findings.is_empty() {
        Ok(None)
    } else {
        Ok(Some(findings.join("; ")))
    }
}

#[tokio::main]
async fn main() {
    std::process::exit(match run().await {
        Ok(None) => 0,
        Ok(Some(msg)) => {
            warn!("{}", msg);
            0
        }
        Err(err) => {
            error!("{}", err);
            1
        }
    });
}
