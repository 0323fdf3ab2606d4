//! Scheme profiles ("kernels"): which AID belongs to which scheme, how that scheme lays
//! out its AIP, and what its responses look like. Profiles are data loaded from
//! `kernels.yaml`; adding a scheme never needs a code change.

use log::{debug, trace};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;

use crate::error::{RelayError, Result};
use crate::tlv::Tag;

mod aip;
mod template;

pub use aip::{AipBits, AipLayout, AipView, AuthMethod};
pub use template::{build_response, forge_application_cryptogram, TemplateContext};

/// Binary configuration value written as a hex string.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(try_from = "String", into = "String")]
pub struct HexBytes(pub Vec<u8>);

impl TryFrom<String> for HexBytes {
    type Error = hex::FromHexError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Ok(HexBytes(hex::decode(value.replace(' ', ""))?))
    }
}

impl From<HexBytes> for String {
    fn from(value: HexBytes) -> String {
        hex::encode_upper(value.0)
    }
}

impl fmt::Debug for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(&self.0))
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseFormat {
    /// Primitive tag 80, values concatenated in the listed tag order.
    Format1,
    /// Constructed tag 77.
    Template,
}

/// Shape of the Issuer Application Data a scheme emits.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IadTemplate {
    pub prefix: HexBytes,
    pub filler_len: usize,
}

impl IadTemplate {
    pub fn len(&self) -> usize {
        self.prefix.0.len() + self.filler_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generate(&self, rng: &mut impl RngCore) -> Vec<u8> {
        let mut iad = self.prefix.0.clone();
        let mut filler = vec![0u8; self.filler_len];
        rng.fill_bytes(&mut filler[..]);
        iad.extend_from_slice(&filler);
        iad
    }

    /// True when `iad` could have been produced by this template.
    pub fn matches(&self, iad: &[u8]) -> bool {
        iad.len() == self.len() && iad.starts_with(&self.prefix.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct KernelProfile {
    pub scheme_id: String,
    pub name: String,
    pub aid: HexBytes,
    pub supported_auth_methods: Vec<AuthMethod>,
    #[serde(default)]
    pub aip_layout: AipLayout,
    pub default_aip: HexBytes,
    pub afl: HexBytes,
    pub response_format: ResponseFormat,
    pub gpo_tags: Vec<Tag>,
    pub record_tags: Vec<Tag>,
    pub generate_ac_tags: Vec<Tag>,
    pub iad: IadTemplate,
    #[serde(default)]
    pub tag_semantics: BTreeMap<Tag, String>,
}

impl KernelProfile {
    fn validate(&self) -> Result<()> {
        if self.aid.0.len() < 5 || self.aid.0.len() > 16 {
            return Err(RelayError::Configuration(format!(
                "{}: AID must be 5 to 16 bytes",
                self.scheme_id
            )));
        }
        if self.default_aip.0.len() != 2 {
            return Err(RelayError::Configuration(format!(
                "{}: default AIP must be 2 bytes",
                self.scheme_id
            )));
        }
        if self.afl.0.len() % 4 != 0 {
            return Err(RelayError::Configuration(format!(
                "{}: AFL length must be a multiple of 4",
                self.scheme_id
            )));
        }

        self.aip_layout
            .validate()
            .map_err(|e| RelayError::Configuration(format!("{}: {}", self.scheme_id, e)))
    }

    pub fn default_aip(&self) -> [u8; 2] {
        match self.default_aip.0[..] {
            [b1, b2] => [b1, b2],
            _ => [0x00, 0x00],
        }
    }

    pub fn aid_hex(&self) -> String {
        hex::encode_upper(&self.aid.0)
    }

    pub fn supports(&self, method: AuthMethod) -> bool {
        self.supported_auth_methods.contains(&method)
    }

    pub fn describe(&self, tag: Tag) -> Option<&str> {
        self.tag_semantics.get(&tag).map(|s| s.as_str())
    }
}

/// Process wide, read-only after construction.
#[derive(Debug, Clone)]
pub struct KernelRegistry {
    profiles: Vec<Arc<KernelProfile>>,
}

impl KernelRegistry {
    pub fn new(profiles: Vec<KernelProfile>) -> Result<KernelRegistry> {
        let mut registered: Vec<Arc<KernelProfile>> = Vec::with_capacity(profiles.len());

        for profile in profiles {
            profile.validate()?;

            if registered.iter().any(|p| p.scheme_id == profile.scheme_id) {
                return Err(RelayError::Configuration(format!(
                    "duplicate kernel profile {}",
                    profile.scheme_id
                )));
            }
            if registered.iter().any(|p| p.aid == profile.aid) {
                return Err(RelayError::Configuration(format!(
                    "AID {} registered twice",
                    profile.aid_hex()
                )));
            }

            trace!(
                "Registered kernel {} ({}) for AID {}",
                profile.scheme_id,
                profile.name,
                profile.aid_hex()
            );
            registered.push(Arc::new(profile));
        }

        Ok(KernelRegistry {
            profiles: registered,
        })
    }

    /// Exact AID match first, then the longest registered AID the presented one
    /// starts with (partial name selection).
    pub fn resolve(&self, aid: &[u8]) -> Result<Arc<KernelProfile>> {
        if let Some(profile) = self.profiles.iter().find(|p| p.aid.0 == aid) {
            return Ok(profile.clone());
        }

        let profile = self
            .profiles
            .iter()
            .filter(|p| aid.starts_with(&p.aid.0))
            .max_by_key(|p| p.aid.0.len())
            .cloned()
            .ok_or_else(|| RelayError::UnknownScheme(hex::encode_upper(aid)))?;

        debug!(
            "AID {} resolved to {} by prefix",
            hex::encode_upper(aid),
            profile.scheme_id
        );
        Ok(profile)
    }

    pub fn get(&self, scheme_id: &str) -> Result<Arc<KernelProfile>> {
        self.profiles
            .iter()
            .find(|p| p.scheme_id == scheme_id)
            .cloned()
            .ok_or_else(|| RelayError::UnknownScheme(scheme_id.to_string()))
    }

    pub fn scheme_ids(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.scheme_id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tlv::tags;

    pub(crate) fn test_registry() -> KernelRegistry {
        let profiles: Vec<KernelProfile> =
            serde_yaml::from_str(include_str!("../../config/kernels.yaml")).unwrap();
        KernelRegistry::new(profiles).unwrap()
    }

    #[test]
    fn test_default_profiles_load() -> Result<()> {
        let registry = test_registry();
        assert_eq!(registry.scheme_ids(), vec!["mastercard", "visa"]);

        let mastercard = registry.get("mastercard")?;
        assert_eq!(mastercard.default_aip(), [0x5C, 0x00]);
        assert_eq!(mastercard.gpo_tags, vec![tags::AIP, tags::AFL]);
        assert!(mastercard.supports(AuthMethod::Cda));
        assert!(mastercard.describe(tags::ISSUER_APPLICATION_DATA).is_some());

        let visa = registry.get("visa")?;
        assert!(!visa.supports(AuthMethod::Cda));
        assert_ne!(visa.aip_layout, mastercard.aip_layout);
        assert_ne!(visa.iad.len(), mastercard.iad.len());
        Ok(())
    }

    #[test]
    fn test_resolve_by_aid() -> Result<()> {
        let registry = test_registry();

        assert_eq!(
            registry.resolve(&hex::decode("A0000000041010")?)?.scheme_id,
            "mastercard"
        );
        // extended AID with a suffix still maps to the scheme
        assert_eq!(
            registry.resolve(&hex::decode("A000000003101001")?)?.scheme_id,
            "visa"
        );
        assert!(matches!(
            registry.resolve(&hex::decode("A0000000651010")?),
            Err(RelayError::UnknownScheme(aid)) if aid == "A0000000651010"
        ));
        assert!(registry.get("amex").is_err());
        Ok(())
    }

    #[test]
    fn test_invalid_profiles_are_rejected() {
        let mut profile = test_registry().get("visa").unwrap().as_ref().clone();
        profile.default_aip = HexBytes(vec![0x20]);
        assert!(KernelRegistry::new(vec![profile.clone()]).is_err());

        profile.default_aip = HexBytes(vec![0x20, 0x00]);
        assert!(KernelRegistry::new(vec![profile.clone(), profile.clone()]).is_err());

        profile.afl = HexBytes(vec![0x08, 0x01, 0x01]);
        assert!(KernelRegistry::new(vec![profile]).is_err());
    }

    #[test]
    fn test_iad_template() {
        use rand::SeedableRng;
        use rand_chacha::ChaCha20Rng;

        let template = IadTemplate {
            prefix: HexBytes(vec![0x06, 0x01, 0x0A, 0x03]),
            filler_len: 3,
        };
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let iad = template.generate(&mut rng);
        assert_eq!(iad.len(), 7);
        assert!(template.matches(&iad));
        assert!(!template.matches(&iad[..6]));

        let mut rng = ChaCha20Rng::seed_from_u64(7);
        assert_eq!(template.generate(&mut rng), iad);
    }
}
