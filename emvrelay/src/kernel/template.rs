use log::{debug, warn};
use openssl::sha;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use super::{KernelProfile, ResponseFormat};
use crate::apdu::{ApduMessage, CommandClass};
use crate::bcdutil;
use crate::error::{RelayError, Result};
use crate::tlv::{tags, Tag, TlvNode};
use crate::{get_truncated_pan, CryptogramType, Track2};

/// Card data a scheme-shaped response is built from.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub pan: Option<String>,
    pub track2: Option<Track2>,
    pub atc: u16,
    /// Overrides the profile's default AIP.
    pub aip: Option<[u8; 2]>,
    pub cryptogram_type: CryptogramType,
    /// Seeds the IAD filler so that forged responses are reproducible.
    pub seed: u64,
}

impl TemplateContext {
    pub fn new(pan: Option<String>, atc: u16) -> TemplateContext {
        TemplateContext {
            pan,
            track2: None,
            atc,
            aip: None,
            cryptogram_type: CryptogramType::TransactionCertificate,
            seed: 0,
        }
    }

    fn pan(&self) -> Option<&str> {
        self.pan
            .as_deref()
            .or_else(|| self.track2.as_ref().map(|t| t.primary_account_number.as_str()))
    }
}

/// Stand-in application cryptogram: SHA-256 over a per-PAN fake key, the ATC and the
/// IAD, truncated to 8 bytes. It only has to look like a cryptogram.
pub fn forge_application_cryptogram(pan: &str, atc: u16, iad: &[u8]) -> [u8; 8] {
    let fake_key = sha::sha256(format!("fake_key_{}", pan).as_bytes());

    let mut hasher = sha::Sha256::new();
    hasher.update(&fake_key[..16]);
    hasher.update(&atc.to_be_bytes());
    hasher.update(iad);
    let digest = hasher.finish();

    let mut cryptogram = [0u8; 8];
    cryptogram.copy_from_slice(&digest[..8]);
    cryptogram
}

// fields whose position in a format 1 response is fixed by the command
const FORMAT1_FIELDS: [Tag; 6] = [
    tags::AIP,
    tags::AFL,
    tags::CRYPTOGRAM_INFORMATION_DATA,
    tags::ATC,
    tags::APPLICATION_CRYPTOGRAM,
    tags::ISSUER_APPLICATION_DATA,
];

struct Material {
    aip: [u8; 2],
    iad: Vec<u8>,
    cryptogram: [u8; 8],
}

fn field_value(
    profile: &KernelProfile,
    context: &TemplateContext,
    material: &Material,
    tag: Tag,
) -> Option<Vec<u8>> {
    let value = match tag {
        tags::AIP => material.aip.to_vec(),
        tags::AFL => profile.afl.0.clone(),
        tags::TRACK2 => context.track2.as_ref()?.to_icc(),
        tags::PAN => {
            let pan = context.pan()?;
            bcdutil::ascii_to_bcd_cn(pan.as_bytes(), (pan.len() + 1) / 2).ok()?
        }
        tags::EXPIRY_DATE => {
            let track2 = context.track2.as_ref()?;
            hex::decode(format!("{}{}31", track2.expiry_year, track2.expiry_month)).ok()?
        }
        tags::PAN_SEQUENCE_NUMBER => vec![0x00],
        tags::CDOL1 => {
            // amount, other amount, country, TVR, currency, date, type, UN
            hex::decode("9F02069F03069F1A0295055F2A029A039C019F3704").ok()?
        }
        tags::CRYPTOGRAM_INFORMATION_DATA => vec![u8::from(context.cryptogram_type)],
        tags::ATC => context.atc.to_be_bytes().to_vec(),
        tags::APPLICATION_CRYPTOGRAM => material.cryptogram.to_vec(),
        tags::ISSUER_APPLICATION_DATA => material.iad.clone(),
        _ => return None,
    };

    Some(value)
}

/// Builds a GPO, READ RECORD or GENERATE AC response shaped the way `profile`'s
/// scheme shapes it. Fields the context cannot supply are left out.
pub fn build_response(
    profile: &KernelProfile,
    context: &TemplateContext,
    command_class: CommandClass,
) -> Result<ApduMessage> {
    let (field_tags, format) = match command_class {
        CommandClass::Gpo => (&profile.gpo_tags, profile.response_format),
        CommandClass::GenerateAc => (&profile.generate_ac_tags, profile.response_format),
        CommandClass::ReadRecord => (&profile.record_tags, ResponseFormat::Template),
        other => {
            return Err(RelayError::MalformedApdu(format!(
                "{} profile does not build {:?} responses",
                profile.scheme_id, other
            )))
        }
    };

    let mut rng = ChaCha20Rng::seed_from_u64(context.seed);
    let iad = profile.iad.generate(&mut rng);
    let cryptogram = forge_application_cryptogram(context.pan().unwrap_or(""), context.atc, &iad);
    let material = Material {
        aip: context.aip.unwrap_or_else(|| profile.default_aip()),
        iad,
        cryptogram,
    };

    let mut fields = Vec::with_capacity(field_tags.len());
    for tag in field_tags {
        match field_value(profile, context, &material, *tag) {
            Some(value) => fields.push(TlvNode::primitive(*tag, value)),
            None => debug!(
                "{}: no value for tag {} in {:?} response",
                profile.scheme_id, tag, command_class
            ),
        }
    }

    if command_class == CommandClass::GenerateAc {
        debug!(
            "Forged {:?} for {} ATC {:04X}",
            context.cryptogram_type,
            get_truncated_pan(context.pan().unwrap_or("")),
            context.atc
        );
    }

    let response = match (command_class, format) {
        (CommandClass::ReadRecord, _) => ApduMessage::response(
            command_class,
            vec![TlvNode::constructed(tags::RECORD_TEMPLATE, fields)],
            [0x90, 0x00],
        ),
        (_, ResponseFormat::Template) => ApduMessage::response(
            command_class,
            vec![TlvNode::constructed(tags::RESPONSE_TEMPLATE, fields)],
            [0x90, 0x00],
        ),
        (_, ResponseFormat::Format1) => {
            if fields.iter().any(|f| !FORMAT1_FIELDS.contains(&f.tag())) {
                warn!(
                    "{}: format 1 response carries tags a terminal cannot locate",
                    profile.scheme_id
                );
            }
            ApduMessage::format1_response(command_class, fields, [0x90, 0x00])
        }
    };

    Ok(response)
}
