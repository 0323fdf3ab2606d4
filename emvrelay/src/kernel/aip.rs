use serde::{Deserialize, Serialize};
use std::fmt;

use super::HexBytes;
use crate::apdu::ApduMessage;
use crate::error::{RelayError, Result};
use crate::tlv::tags;

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    Sda,
    Dda,
    Cda,
}

impl AuthMethod {
    pub const ALL: [AuthMethod; 3] = [AuthMethod::Sda, AuthMethod::Dda, AuthMethod::Cda];
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            AuthMethod::Sda => "SDA",
            AuthMethod::Dda => "DDA",
            AuthMethod::Cda => "CDA",
        };
        write!(f, "{}", name)
    }
}

/// Where one authentication method lives in the AIP. `mask` covers every bit a scheme
/// uses to announce the method, `primary` is the bit written when forcing it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AipBits {
    pub primary: HexBytes,
    pub mask: HexBytes,
}

impl AipBits {
    fn new(primary: [u8; 2], mask: [u8; 2]) -> AipBits {
        AipBits {
            primary: HexBytes(primary.to_vec()),
            mask: HexBytes(mask.to_vec()),
        }
    }

    fn primary(&self) -> [u8; 2] {
        as_aip(&self.primary.0)
    }

    fn mask(&self) -> [u8; 2] {
        as_aip(&self.mask.0)
    }
}

fn as_aip(bytes: &[u8]) -> [u8; 2] {
    [
        bytes.first().copied().unwrap_or(0),
        bytes.get(1).copied().unwrap_or(0),
    ]
}

/// Per scheme assignment of AIP bits to authentication methods.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AipLayout {
    pub sda: AipBits,
    pub dda: AipBits,
    pub cda: AipBits,
}

impl Default for AipLayout {
    // ref. EMV Book 3, C1 Application Interchange Profile
    fn default() -> Self {
        AipLayout {
            sda: AipBits::new([0x40, 0x00], [0x40, 0x00]),
            dda: AipBits::new([0x20, 0x00], [0x20, 0x00]),
            cda: AipBits::new([0x01, 0x00], [0x01, 0x00]),
        }
    }
}

impl AipLayout {
    pub fn validate(&self) -> Result<()> {
        for method in AuthMethod::ALL {
            let bits = self.bits(method);
            if bits.primary.0.len() != 2 || bits.mask.0.len() != 2 {
                return Err(RelayError::Configuration(format!(
                    "{} AIP bits must be 2 bytes",
                    method
                )));
            }

            let primary = bits.primary();
            let mask = bits.mask();
            if primary == [0, 0] || primary[0] & !mask[0] != 0 || primary[1] & !mask[1] != 0 {
                return Err(RelayError::Configuration(format!(
                    "{} primary bit {:02X?} is not inside mask {:02X?}",
                    method, primary, mask
                )));
            }
        }

        Ok(())
    }

    pub fn bits(&self, method: AuthMethod) -> &AipBits {
        match method {
            AuthMethod::Sda => &self.sda,
            AuthMethod::Dda => &self.dda,
            AuthMethod::Cda => &self.cda,
        }
    }

    /// Union of every authentication mask.
    pub fn auth_mask(&self) -> [u8; 2] {
        AuthMethod::ALL.iter().fold([0, 0], |acc, method| {
            let mask = self.bits(*method).mask();
            [acc[0] | mask[0], acc[1] | mask[1]]
        })
    }

    pub fn view(&self, aip: [u8; 2]) -> AipView<'_> {
        AipView { aip, layout: self }
    }

    /// AIP announcing `method` only. Bits outside the authentication masks are kept.
    pub fn with_only(&self, aip: [u8; 2], method: AuthMethod) -> [u8; 2] {
        let auth_mask = self.auth_mask();
        let primary = self.bits(method).primary();

        [
            (aip[0] & !auth_mask[0]) | primary[0],
            (aip[1] & !auth_mask[1]) | primary[1],
        ]
    }
}

/// Read-only projection of an AIP through a scheme layout.
#[derive(Debug, Clone, Copy)]
pub struct AipView<'a> {
    aip: [u8; 2],
    layout: &'a AipLayout,
}

impl<'a> AipView<'a> {
    pub fn from_message(message: &ApduMessage, layout: &'a AipLayout) -> Option<AipView<'a>> {
        match message.value(tags::AIP)? {
            [b1, b2] => Some(layout.view([*b1, *b2])),
            _ => None,
        }
    }

    pub fn bytes(&self) -> [u8; 2] {
        self.aip
    }

    pub fn supports(&self, method: AuthMethod) -> bool {
        let mask = self.layout.bits(method).mask();
        self.aip[0] & mask[0] != 0 || self.aip[1] & mask[1] != 0
    }

    pub fn sda(&self) -> bool {
        self.supports(AuthMethod::Sda)
    }

    pub fn dda(&self) -> bool {
        self.supports(AuthMethod::Dda)
    }

    pub fn cda(&self) -> bool {
        self.supports(AuthMethod::Cda)
    }

    pub fn methods(&self) -> Vec<AuthMethod> {
        AuthMethod::ALL
            .iter()
            .copied()
            .filter(|method| self.supports(*method))
            .collect()
    }

    pub fn is_sole(&self, method: AuthMethod) -> bool {
        self.methods() == [method]
    }

    /// Byte 1 bit 2
    pub fn on_device_cardholder_verification(&self) -> bool {
        get_bit!(self.aip[0], 1)
    }

    /// Byte 2 bit 8
    pub fn emv_mode_supported(&self) -> bool {
        get_bit!(self.aip[1], 7)
    }

    /// Byte 2 bit 1, Mastercard relay resistance protocol
    pub fn relay_resistance_protocol(&self) -> bool {
        get_bit!(self.aip[1], 0)
    }

    pub fn non_auth_bits(&self) -> [u8; 2] {
        let mask = self.layout.auth_mask();
        [self.aip[0] & !mask[0], self.aip[1] & !mask[1]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mastercard_layout() -> AipLayout {
        AipLayout {
            sda: AipBits::new([0x40, 0x00], [0x40, 0x00]),
            dda: AipBits::new([0x20, 0x00], [0x28, 0x00]),
            cda: AipBits::new([0x01, 0x00], [0x15, 0x00]),
        }
    }

    #[test]
    fn test_view_named_bits() {
        let layout = mastercard_layout();
        let view = layout.view([0x5C, 0x81]);
        assert!(view.sda());
        assert!(view.dda());
        assert!(view.cda());
        assert!(view.emv_mode_supported());
        assert!(view.relay_resistance_protocol());
        assert!(!view.on_device_cardholder_verification());
        assert_eq!(view.non_auth_bits(), [0x00, 0x81]);

        let standard = AipLayout::default();
        assert_eq!(standard.view([0x5C, 0x00]).methods(), vec![AuthMethod::Sda]);
        assert!(standard.view([0x40, 0x00]).is_sole(AuthMethod::Sda));
    }

    #[test]
    fn test_with_only_keeps_unrelated_bits() {
        let layout = mastercard_layout();
        assert_eq!(layout.with_only([0x5C, 0x00], AuthMethod::Sda), [0x40, 0x00]);
        assert_eq!(layout.with_only([0x20, 0x00], AuthMethod::Sda), [0x40, 0x00]);
        assert_eq!(layout.with_only([0x7E, 0x81], AuthMethod::Sda), [0x42, 0x81]);
        assert_eq!(layout.with_only([0x40, 0x00], AuthMethod::Dda), [0x20, 0x00]);

        let standard = AipLayout::default();
        assert_eq!(standard.with_only([0x39, 0x80], AuthMethod::Sda), [0x58, 0x80]);
    }

    #[test]
    fn test_layout_validation() {
        assert!(mastercard_layout().validate().is_ok());

        let mut broken = AipLayout::default();
        broken.cda = AipBits::new([0x02, 0x00], [0x01, 0x00]);
        assert!(broken.validate().is_err());

        broken.cda = AipBits {
            primary: HexBytes(vec![0x01]),
            mask: HexBytes(vec![0x01, 0x00]),
        };
        assert!(broken.validate().is_err());
    }
}
