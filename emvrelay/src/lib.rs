use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;
use std::fs::{self};

macro_rules! get_bit {
    ($byte:expr, $bit:expr) => {
        if $byte & (1 << $bit) != 0 {
            true
        } else {
            false
        }
    };
}

macro_rules! serialize_yaml {
    ($file:expr, $static_resource:expr) => {{
        let file = $file;
        let contents = match fs::read_to_string(&file) {
            Ok(contents) => contents,
            Err(err) => {
                warn!("Could not read {}: {}, using built-in defaults", file, err);
                String::from_utf8_lossy(include_bytes!($static_resource)).to_string()
            }
        };
        serde_yaml::from_str(&contents)
    }};
}

pub mod apdu;
pub mod attack;
pub mod bcdutil;
pub mod error;
pub mod kernel;
pub mod relay;
pub mod scheduler;
pub mod session;
pub mod tlv;

pub use apdu::{ApduMessage, CommandClass};
pub use error::{RelayError, Result};
pub use kernel::{KernelProfile, KernelRegistry};
pub use relay::{Frame, FrameOrigin, RelayPipeline, RelayWorker};
pub use scheduler::TimingScheduler;
pub use session::{SessionRegistry, TransactionSession, TransactionState};

// PCI SSC PAN truncation rules ref. https://d30000001huxdea4.my.salesforce-sites.com/faq/articles/Frequently_Asked_Question/What-are-acceptable-formats-for-truncation-of-primary-account-numbers
pub fn get_truncated_pan(pan: &str) -> String {
    let uncensored_bin_prefix_length = if pan.len() > 15 { 8 } else { 6 };

    let truncated_pan: String = pan
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if i >= uncensored_bin_prefix_length && i + 4 < pan.len() {
                '*'
            } else {
                c
            }
        })
        .collect();

    truncated_pan
}

/// Which way a buffer travels through the relay.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    CardToTerminal,
    TerminalToCard,
}

impl Direction {
    pub fn reverse(self) -> Direction {
        match self {
            Direction::CardToTerminal => Direction::TerminalToCard,
            Direction::TerminalToCard => Direction::CardToTerminal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track2 {
    pub primary_account_number: String,
    pub expiry_year: String,
    pub expiry_month: String,
    pub service_code: String,
    pub discretionary_data: String,
}

impl Track2 {
    pub fn new(track_data: &str) -> Option<Track2> {
        // Supports human readable and ICC formats
        // human readable: ;4321432143214321=2612101123456789123?
        // ICC: 4321432143214321D2612101123456789123F

        let re = Regex::new(r"^;?(\d+)(=|D)(\d{2})(\d{2})(\d{3})(\d*)F?\??$").ok()?;
        let cap = re.captures(track_data)?;

        Some(Track2 {
            primary_account_number: cap.get(1)?.as_str().to_string(),
            expiry_year: cap.get(3)?.as_str().to_string(),
            expiry_month: cap.get(4)?.as_str().to_string(),
            service_code: cap.get(5)?.as_str().to_string(),
            discretionary_data: cap.get(6).map_or("", |m| m.as_str()).to_string(),
        })
    }

    /// Track 2 Equivalent Data (tag 57) as returned by the ICC.
    pub fn from_icc(value: &[u8]) -> Option<Track2> {
        Track2::new(&hex::encode_upper(value))
    }

    /// Packs the track back into tag 57 form, padded with F to a full byte.
    pub fn to_icc(&self) -> Vec<u8> {
        let mut nibbles = format!(
            "{}D{}{}{}{}",
            self.primary_account_number,
            self.expiry_year,
            self.expiry_month,
            self.service_code,
            self.discretionary_data
        );
        if nibbles.len() % 2 == 1 {
            nibbles.push('F');
        }

        // only digits and D/F at this point
        hex::decode(nibbles).unwrap_or_default()
    }

    pub fn censor(&mut self) {
        self.primary_account_number = get_truncated_pan(&self.primary_account_number);
        self.discretionary_data = self.discretionary_data.replace(|_c: char| true, "*");
    }
}

impl fmt::Display for Track2 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            ";{}={}{}{}{}?",
            self.primary_account_number,
            self.expiry_year,
            self.expiry_month,
            self.service_code,
            self.discretionary_data
        )
    }
}

#[repr(u8)]
#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum CryptogramType {
    // bits 6-7 are relevant
    ApplicationAuthenticationCryptogram = 0b0000_0000, // AAC, transaction declined
    AuthorisationRequestCryptogram = 0b1000_0000,      // ARQC, online authorisation requested
    TransactionCertificate = 0b0100_0000,              // TC, transaction approved
}

impl From<CryptogramType> for u8 {
    fn from(orig: CryptogramType) -> Self {
        match orig {
            CryptogramType::ApplicationAuthenticationCryptogram => 0b0000_0000,
            CryptogramType::AuthorisationRequestCryptogram => 0b1000_0000,
            CryptogramType::TransactionCertificate => 0b0100_0000,
        }
    }
}

impl TryFrom<u8> for CryptogramType {
    type Error = &'static str;

    fn try_from(orig: u8) -> std::result::Result<Self, Self::Error> {
        match orig >> 6 << 6 {
            0b0000_0000 => Ok(CryptogramType::ApplicationAuthenticationCryptogram),
            0b1000_0000 => Ok(CryptogramType::AuthorisationRequestCryptogram),
            0b0100_0000 => Ok(CryptogramType::TransactionCertificate),
            _ => Err("Unknown code!"),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldSensitivity {
    Public,
    SensitiveAuthenticationData,
    Sensitive,
    Track2,
    PrimaryAccountNumber,
    PersonallyIdentifiableInformation,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EmvTag {
    pub tag: String,
    pub name: String,
    pub sensitivity: Option<FieldSensitivity>,
}

impl EmvTag {
    pub fn new(tag_name: &str) -> EmvTag {
        EmvTag {
            tag: tag_name.to_string(),
            name: "Unknown tag".to_string(),
            sensitivity: None,
        }
    }
}

pub type TagDictionary = HashMap<String, EmvTag>;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConfigurationFiles {
    pub emv_tags: String,
    pub kernels: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Settings {
    pub censor_sensitive_fields: bool,
    pub configuration_files: ConfigurationFiles,
    pub attacks: attack::AttackSettings,
    pub scheduler: scheduler::SchedulerSettings,
    pub session: session::SessionSettings,
}

impl Settings {
    pub fn load(settings_file: &str) -> Result<Settings> {
        let settings: Settings = serialize_yaml!(settings_file, "../config/settings.yaml")?;
        Ok(settings)
    }
}

/// Everything a relay needs, loaded once at startup and shared read-only afterwards.
pub struct Configuration {
    pub settings: Settings,
    pub tags: TagDictionary,
    pub kernels: KernelRegistry,
}

impl Configuration {
    pub fn load(settings_file: &str) -> Result<Configuration> {
        let settings = Settings::load(settings_file)?;
        Configuration::from_settings(settings)
    }

    pub fn from_settings(settings: Settings) -> Result<Configuration> {
        let emv_tags: Vec<EmvTag> = serialize_yaml!(
            settings.configuration_files.emv_tags.clone(),
            "../config/emv_tags.yaml"
        )?;
        let profiles: Vec<KernelProfile> = serialize_yaml!(
            settings.configuration_files.kernels.clone(),
            "../config/kernels.yaml"
        )?;

        let tags: TagDictionary = emv_tags
            .into_iter()
            .map(|emv_tag| (emv_tag.tag.clone(), emv_tag))
            .collect();
        let kernels = KernelRegistry::new(profiles)?;

        debug!(
            "Loaded {} tag definitions and {} kernel profiles",
            tags.len(),
            kernels.len()
        );
        if !settings.censor_sensitive_fields {
            warn!("Sensitive field censoring is disabled, card data will be logged in clear");
        }

        Ok(Configuration {
            settings,
            tags,
            kernels,
        })
    }
}

pub fn is_success_response(response_trailer: &[u8]) -> bool {
    response_trailer.len() >= 2 && response_trailer[0] == 0x90 && response_trailer[1] == 0x00
}
