//! Typed, immutable views over the command and response APDUs of a contactless
//! transaction. A message is parsed once from transport bytes; every change produces a
//! new message and the original bytes stay available for fail-safe forwarding.

use log::trace;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::sync::Arc;

use crate::error::{RelayError, Result};
use crate::tlv::{self, tags, Tag, TlvNode};
use crate::{is_success_response, CryptogramType, Direction};

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CommandClass {
    Select,
    Gpo,
    ReadRecord,
    GenerateAc,
    Other,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommandHeader {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
}

impl CommandHeader {
    // ref. EMV Book 3, 6.5 Commands for Financial Transaction
    fn classify(&self) -> CommandClass {
        match (self.cla, self.ins) {
            (0x00, 0xA4) if self.p1 == 0x04 => CommandClass::Select,
            (0x80, 0xA8) => CommandClass::Gpo,
            (0x00, 0xB2) => CommandClass::ReadRecord,
            (0x80, 0xAE) => CommandClass::GenerateAc,
            _ => CommandClass::Other,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum BodyLayout {
    /// No data field.
    Empty,
    /// Data field that is not BER-TLV (AID of a SELECT, CDOL data of a GENERATE AC).
    Opaque,
    /// BER-TLV data objects, usually a single 6F/70/77 template.
    Template,
    /// Response Message Template Format 1: tag 80 with concatenated values whose
    /// positions are fixed by the command. `body` holds the split-out fields.
    Format1,
}

#[derive(Debug, Clone)]
pub struct ApduMessage {
    direction: Direction,
    command_class: CommandClass,
    header: Option<CommandHeader>,
    le: Option<u8>,
    data: Arc<[u8]>,
    body: Vec<TlvNode>,
    layout: BodyLayout,
    status: Option<[u8; 2]>,
    raw: Arc<[u8]>,
    modified: bool,
}

impl ApduMessage {
    /// Parses transport bytes. Responses are classified from their tags alone; use
    /// [`ApduMessage::parse_response`] when the preceding command is known.
    pub fn parse(direction: Direction, bytes: &[u8]) -> Result<ApduMessage> {
        match direction {
            Direction::TerminalToCard => ApduMessage::parse_command(bytes),
            Direction::CardToTerminal => ApduMessage::parse_response(bytes, None),
        }
    }

    pub fn parse_command(bytes: &[u8]) -> Result<ApduMessage> {
        if bytes.len() < 4 {
            return Err(RelayError::MalformedApdu(format!(
                "command of {} bytes",
                bytes.len()
            )));
        }

        let header = CommandHeader {
            cla: bytes[0],
            ins: bytes[1],
            p1: bytes[2],
            p2: bytes[3],
        };
        let command_class = header.classify();

        // ref. ISO/IEC 7816-3, 12.1 cases 1-4, short length fields only
        let (data, le): (&[u8], Option<u8>) = match bytes.len() {
            4 => (&[], None),
            5 => (&[], Some(bytes[4])),
            _ => {
                let lc = bytes[4] as usize;
                if lc == 0 {
                    return Err(RelayError::MalformedApdu(
                        "extended length commands are not relayed".to_string(),
                    ));
                }
                let end = 5 + lc;
                if bytes.len() < end || bytes.len() > end + 1 {
                    return Err(RelayError::MalformedApdu(format!(
                        "Lc {} does not match command of {} bytes",
                        lc,
                        bytes.len()
                    )));
                }
                (&bytes[5..end], bytes.get(end).copied())
            }
        };

        let (body, layout) = match command_class {
            CommandClass::Gpo if !data.is_empty() => (tlv::decode(data)?, BodyLayout::Template),
            _ if data.is_empty() => (Vec::new(), BodyLayout::Empty),
            _ => (Vec::new(), BodyLayout::Opaque),
        };

        trace!(
            "Parsed {:?} command {:02X?} ({} data bytes)",
            command_class,
            &bytes[..4],
            data.len()
        );

        Ok(ApduMessage {
            direction: Direction::TerminalToCard,
            command_class,
            header: Some(header),
            le,
            data: Arc::from(data),
            body,
            layout,
            status: None,
            raw: Arc::from(bytes),
            modified: false,
        })
    }

    /// Parses a card response. `expected` is the class of the command it answers and
    /// is needed to split a format 1 (tag 80) response into its fields.
    pub fn parse_response(bytes: &[u8], expected: Option<CommandClass>) -> Result<ApduMessage> {
        if bytes.len() < 2 {
            return Err(RelayError::MalformedApdu(format!(
                "response of {} bytes",
                bytes.len()
            )));
        }

        let (data, trailer) = bytes.split_at(bytes.len() - 2);
        let status = [trailer[0], trailer[1]];

        let (body, layout, command_class) = if data.is_empty() {
            (
                Vec::new(),
                BodyLayout::Empty,
                expected.unwrap_or(CommandClass::Other),
            )
        } else {
            let nodes = tlv::decode(data)?;
            let command_class = expected.unwrap_or_else(|| classify_response(&nodes));
            match split_format1(&nodes, command_class) {
                Some(fields) => (fields, BodyLayout::Format1, command_class),
                None => (nodes, BodyLayout::Template, command_class),
            }
        };

        Ok(ApduMessage {
            direction: Direction::CardToTerminal,
            command_class,
            header: None,
            le: None,
            data: Arc::from(data),
            body,
            layout,
            status: Some(status),
            raw: Arc::from(bytes),
            modified: false,
        })
    }

    /// A synthesized card response in format 2 (template) layout.
    pub fn response(command_class: CommandClass, body: Vec<TlvNode>, status: [u8; 2]) -> ApduMessage {
        let mut bytes = tlv::encode(&body);
        bytes.extend_from_slice(&status);
        let data_len = bytes.len() - 2;

        ApduMessage {
            direction: Direction::CardToTerminal,
            command_class,
            header: None,
            le: None,
            data: Arc::from(&bytes[..data_len]),
            body,
            layout: BodyLayout::Template,
            status: Some(status),
            raw: Arc::from(bytes),
            modified: false,
        }
    }

    /// A synthesized format 1 response. `fields` are given in wire order.
    pub fn format1_response(command_class: CommandClass, fields: Vec<TlvNode>, status: [u8; 2]) -> ApduMessage {
        let value: Vec<u8> = fields
            .iter()
            .filter_map(|field| field.bytes())
            .flatten()
            .copied()
            .collect();
        let data = TlvNode::primitive(tags::RESPONSE_FORMAT_1, value).to_vec();
        let mut bytes = data.clone();
        bytes.extend_from_slice(&status);

        ApduMessage {
            direction: Direction::CardToTerminal,
            command_class,
            header: None,
            le: None,
            data: Arc::from(data),
            body: fields,
            layout: BodyLayout::Format1,
            status: Some(status),
            raw: Arc::from(bytes),
            modified: false,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn command_class(&self) -> CommandClass {
        self.command_class
    }

    pub fn header(&self) -> Option<CommandHeader> {
        self.header
    }

    pub fn status(&self) -> Option<[u8; 2]> {
        self.status
    }

    pub fn is_success(&self) -> bool {
        match self.status {
            Some(status) => is_success_response(&status),
            None => false,
        }
    }

    pub fn is_format1(&self) -> bool {
        self.layout == BodyLayout::Format1
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw[..]
    }

    /// Command data field (or response data without the status word), as received.
    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn body(&self) -> &[TlvNode] {
        &self.body[..]
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn get(&self, tag: Tag) -> Option<&TlvNode> {
        tlv::find(&self.body, tag)
    }

    pub fn value(&self, tag: Tag) -> Option<&[u8]> {
        self.get(tag).and_then(|node| node.bytes())
    }

    /// Primitive data objects in wire order, templates flattened.
    pub fn fields(&self) -> Vec<&TlvNode> {
        fn walk<'a>(nodes: &'a [TlvNode], output: &mut Vec<&'a TlvNode>) {
            for node in nodes {
                if node.bytes().is_some() {
                    output.push(node);
                } else {
                    walk(node.children(), output);
                }
            }
        }

        let mut output = Vec::new();
        walk(&self.body, &mut output);
        output
    }

    /// Copy of this message with `tag` set to `value`. A tag that is not present is
    /// appended to the response template (or at top level when there is none). Format 1
    /// bodies are positional and only take tags they already carry.
    pub fn with(&self, tag: Tag, value: Vec<u8>) -> Result<ApduMessage> {
        let replacement = TlvNode::primitive(tag, value);

        let body = match self.layout {
            BodyLayout::Template | BodyLayout::Format1 => match tlv::replace(&self.body, &replacement) {
                Some(body) => body,
                None if self.layout == BodyLayout::Format1 => {
                    return Err(RelayError::MalformedApdu(format!(
                        "format 1 {:?} response has no slot for tag {}",
                        self.command_class, tag
                    )))
                }
                None => append_to_template(&self.body, replacement),
            },
            BodyLayout::Empty if self.direction == Direction::CardToTerminal => vec![replacement],
            _ => {
                return Err(RelayError::MalformedApdu(format!(
                    "{:?} {:?} has no TLV data field to carry tag {}",
                    self.direction, self.command_class, tag
                )))
            }
        };

        let layout = if self.layout == BodyLayout::Empty {
            BodyLayout::Template
        } else {
            self.layout
        };

        let mut message = ApduMessage {
            body,
            layout,
            modified: true,
            ..self.clone()
        };
        message.data = Arc::from(message.encode_data());
        // short Lc only, see parse_command
        if message.header.is_some() && message.data.len() > 0xFF {
            return Err(RelayError::MalformedApdu(format!(
                "{:?} command data of {} bytes does not fit a short Lc",
                self.command_class,
                message.data.len()
            )));
        }
        Ok(message)
    }

    /// Bytes for onward transport. Untouched messages are forwarded exactly as
    /// received, padding and non-minimal lengths included.
    pub fn to_bytes(&self) -> Vec<u8> {
        if self.modified {
            self.encode()
        } else {
            self.raw.to_vec()
        }
    }

    fn encode_data(&self) -> Vec<u8> {
        match self.layout {
            BodyLayout::Empty => Vec::new(),
            BodyLayout::Opaque => self.data.to_vec(),
            BodyLayout::Template => tlv::encode(&self.body),
            BodyLayout::Format1 => {
                let value: Vec<u8> = self
                    .body
                    .iter()
                    .filter_map(|field| field.bytes())
                    .flatten()
                    .copied()
                    .collect();
                TlvNode::primitive(tags::RESPONSE_FORMAT_1, value).to_vec()
            }
        }
    }

    fn encode(&self) -> Vec<u8> {
        let data = self.encode_data();
        let mut output = Vec::with_capacity(data.len() + 6);

        if let Some(header) = self.header {
            output.extend_from_slice(&[header.cla, header.ins, header.p1, header.p2]);
            if !data.is_empty() {
                output.push(data.len() as u8);
            }
            output.extend_from_slice(&data);
            if let Some(le) = self.le {
                output.push(le);
            }
        } else {
            output.extend_from_slice(&data);
        }

        if let Some(status) = self.status {
            output.extend_from_slice(&status);
        }

        output
    }

    /// AID of a SELECT command, or the DF name of a SELECT response.
    pub fn aid(&self) -> Option<&[u8]> {
        if self.command_class != CommandClass::Select {
            return None;
        }

        match self.direction {
            Direction::TerminalToCard if !self.data.is_empty() => Some(&self.data[..]),
            Direction::TerminalToCard => None,
            Direction::CardToTerminal => self.value(tags::DF_NAME),
        }
    }

    /// Cryptogram type asked for in GENERATE AC P1.
    pub fn requested_cryptogram(&self) -> Option<CryptogramType> {
        match (self.command_class, self.header) {
            (CommandClass::GenerateAc, Some(header)) => CryptogramType::try_from(header.p1).ok(),
            _ => None,
        }
    }

    /// Cryptogram type returned by the card in the Cryptogram Information Data.
    pub fn cryptogram_type(&self) -> Option<CryptogramType> {
        let cid = self.value(tags::CRYPTOGRAM_INFORMATION_DATA)?;
        CryptogramType::try_from(*cid.first()?).ok()
    }

    pub fn atc(&self) -> Option<u16> {
        match self.value(tags::ATC)? {
            [high, low] => Some(u16::from_be_bytes([*high, *low])),
            _ => None,
        }
    }
}

fn classify_response(nodes: &[TlvNode]) -> CommandClass {
    let top = match nodes.first() {
        Some(node) => node.tag(),
        None => return CommandClass::Other,
    };

    if top == tags::FCI_TEMPLATE {
        CommandClass::Select
    } else if top == tags::RECORD_TEMPLATE {
        CommandClass::ReadRecord
    } else if tlv::find(nodes, tags::CRYPTOGRAM_INFORMATION_DATA).is_some()
        || tlv::find(nodes, tags::APPLICATION_CRYPTOGRAM).is_some()
    {
        CommandClass::GenerateAc
    } else if tlv::find(nodes, tags::AIP).is_some() || tlv::find(nodes, tags::AFL).is_some() {
        CommandClass::Gpo
    } else {
        // a bare tag 80 cannot be told apart without the command it answers
        CommandClass::Other
    }
}

// ref. EMV Book 3, 6.5.8.4 (GPO) and 6.5.5.4 (GENERATE AC) format 1 responses
fn split_format1(nodes: &[TlvNode], command_class: CommandClass) -> Option<Vec<TlvNode>> {
    if nodes.len() != 1 || nodes[0].tag() != tags::RESPONSE_FORMAT_1 {
        return None;
    }
    let value = nodes[0].bytes()?;

    match command_class {
        CommandClass::Gpo if value.len() >= 2 => Some(vec![
            TlvNode::primitive(tags::AIP, value[..2].to_vec()),
            TlvNode::primitive(tags::AFL, value[2..].to_vec()),
        ]),
        CommandClass::GenerateAc if value.len() >= 11 => {
            let mut fields = vec![
                TlvNode::primitive(tags::CRYPTOGRAM_INFORMATION_DATA, value[..1].to_vec()),
                TlvNode::primitive(tags::ATC, value[1..3].to_vec()),
                TlvNode::primitive(tags::APPLICATION_CRYPTOGRAM, value[3..11].to_vec()),
            ];
            if value.len() > 11 {
                fields.push(TlvNode::primitive(
                    tags::ISSUER_APPLICATION_DATA,
                    value[11..].to_vec(),
                ));
            }
            Some(fields)
        }
        _ => None,
    }
}

fn append_to_template(body: &[TlvNode], node: TlvNode) -> Vec<TlvNode> {
    let mut output = body.to_vec();
    match output.first() {
        Some(first) if first.tag().is_constructed() && output.len() == 1 => {
            output[0] = first.with_child(node);
        }
        _ => output.push(node),
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Vec<u8> {
        hex::decode(s.replace(' ', "")).unwrap()
    }

    #[test]
    fn test_classify_commands() -> Result<()> {
        let select = ApduMessage::parse(
            Direction::TerminalToCard,
            &bytes("00 A4 04 00 07 A0000000041010 00"),
        )?;
        assert_eq!(select.command_class(), CommandClass::Select);
        assert_eq!(select.aid(), Some(&bytes("A0000000041010")[..]));

        let gpo = ApduMessage::parse(Direction::TerminalToCard, &bytes("80 A8 00 00 02 83 00 00"))?;
        assert_eq!(gpo.command_class(), CommandClass::Gpo);
        assert!(gpo.get(tags::COMMAND_TEMPLATE).is_some());

        let read_record = ApduMessage::parse(Direction::TerminalToCard, &bytes("00 B2 01 0C 00"))?;
        assert_eq!(read_record.command_class(), CommandClass::ReadRecord);

        let generate_ac = ApduMessage::parse(
            Direction::TerminalToCard,
            &bytes("80 AE 80 00 04 00000001 00"),
        )?;
        assert_eq!(generate_ac.command_class(), CommandClass::GenerateAc);
        assert_eq!(
            generate_ac.requested_cryptogram(),
            Some(CryptogramType::AuthorisationRequestCryptogram)
        );

        let get_data = ApduMessage::parse(Direction::TerminalToCard, &bytes("80 CA 9F 36 00"))?;
        assert_eq!(get_data.command_class(), CommandClass::Other);
        Ok(())
    }

    #[test]
    fn test_malformed_commands() {
        assert!(ApduMessage::parse(Direction::TerminalToCard, &[0x00, 0xA4]).is_err());
        // Lc says 7, only 2 data bytes present
        assert!(ApduMessage::parse(Direction::TerminalToCard, &bytes("00 A4 04 00 07 A000")).is_err());
        // GPO data must be a TLV template
        assert!(matches!(
            ApduMessage::parse(Direction::TerminalToCard, &bytes("80 A8 00 00 02 83 05 00")),
            Err(RelayError::MalformedTlv { .. })
        ));
    }

    #[test]
    fn test_classify_responses_by_tags() -> Result<()> {
        let fci = ApduMessage::parse(
            Direction::CardToTerminal,
            &bytes("6F1A8407A0000000041010A50F500A4D415354455243415244870101 9000"),
        )?;
        assert_eq!(fci.command_class(), CommandClass::Select);
        assert_eq!(fci.aid(), Some(&bytes("A0000000041010")[..]));
        assert!(fci.is_success());

        let gpo = ApduMessage::parse(Direction::CardToTerminal, &bytes("770A82021980940408010100 9000"))?;
        assert_eq!(gpo.command_class(), CommandClass::Gpo);
        assert_eq!(gpo.value(tags::AIP), Some(&[0x19, 0x80][..]));

        let record = ApduMessage::parse(Direction::CardToTerminal, &bytes("7006 5A03 123456 9000"))?;
        assert_eq!(record.command_class(), CommandClass::ReadRecord);

        let ac = ApduMessage::parse(
            Direction::CardToTerminal,
            &bytes("7714 9F2701 80 9F3602 0042 9F2608 1122334455667788 9000"),
        )?;
        assert_eq!(ac.command_class(), CommandClass::GenerateAc);
        assert_eq!(ac.cryptogram_type(), Some(CryptogramType::AuthorisationRequestCryptogram));
        assert_eq!(ac.atc(), Some(0x42));

        let error = ApduMessage::parse(Direction::CardToTerminal, &bytes("6A82"))?;
        assert_eq!(error.command_class(), CommandClass::Other);
        assert!(!error.is_success());

        // format 1 is ambiguous without the command
        let format1 = ApduMessage::parse(Direction::CardToTerminal, &bytes("8006 1980 08010100 9000"))?;
        assert_eq!(format1.command_class(), CommandClass::Other);
        Ok(())
    }

    #[test]
    fn test_format1_responses_are_split_and_repacked() -> Result<()> {
        let raw = bytes("8006 1980 08010100 9000");
        let gpo = ApduMessage::parse_response(&raw, Some(CommandClass::Gpo))?;
        assert!(gpo.is_format1());
        assert_eq!(gpo.value(tags::AIP), Some(&[0x19, 0x80][..]));
        assert_eq!(gpo.value(tags::AFL), Some(&bytes("08010100")[..]));
        assert_eq!(gpo.to_bytes(), raw);

        let downgraded = gpo.with(tags::AIP, vec![0x40, 0x00])?;
        assert_eq!(downgraded.to_bytes(), bytes("8006 4000 08010100 9000"));

        let ac = ApduMessage::parse_response(
            &bytes("8012 40 0042 1122334455667788 06010A03A00000 9000"),
            Some(CommandClass::GenerateAc),
        )?;
        assert_eq!(ac.cryptogram_type(), Some(CryptogramType::TransactionCertificate));
        assert_eq!(ac.value(tags::ISSUER_APPLICATION_DATA), Some(&bytes("06010A03A00000")[..]));
        Ok(())
    }

    #[test]
    fn test_with_is_copy_on_write() -> Result<()> {
        let raw = bytes("770A82021980940408010100 9000");
        let original = ApduMessage::parse(Direction::CardToTerminal, &raw)?;
        let changed = original.with(tags::AIP, vec![0x40, 0x00])?;

        assert_eq!(original.value(tags::AIP), Some(&[0x19, 0x80][..]));
        assert_eq!(original.to_bytes(), raw);
        assert!(changed.is_modified());
        assert_eq!(changed.to_bytes(), bytes("770A82024000940408010100 9000"));
        assert_eq!(changed.raw(), &raw[..]);

        // missing tags go into the response template
        let with_atc = original.with(tags::ATC, vec![0x00, 0x07])?;
        assert_eq!(
            with_atc.to_bytes(),
            bytes("770F820219809404080101009F36020007 9000")
        );
        Ok(())
    }

    #[test]
    fn test_format1_has_no_room_for_new_tags() -> Result<()> {
        let gpo = ApduMessage::parse_response(&bytes("8006 1980 08010100 9000"), Some(CommandClass::Gpo))?;
        assert!(matches!(
            gpo.with(tags::ATC, vec![0x00, 0x07]),
            Err(RelayError::MalformedApdu(_))
        ));
        assert_eq!(gpo.fields().len(), 2);
        Ok(())
    }

    #[test]
    fn test_command_data_stays_within_short_lc() -> Result<()> {
        let gpo = ApduMessage::parse_command(&bytes("80A8000002830000"))?;

        let pdol_data = gpo.with(tags::COMMAND_TEMPLATE, vec![0x11; 200])?;
        let encoded = pdol_data.to_bytes();
        assert_eq!(encoded[4], 203);
        assert_eq!(encoded.len(), 4 + 1 + 203 + 1);

        assert!(matches!(
            gpo.with(tags::COMMAND_TEMPLATE, vec![0x11; 255]),
            Err(RelayError::MalformedApdu(_))
        ));
        Ok(())
    }

    #[test]
    fn test_untouched_message_keeps_padding() -> Result<()> {
        let raw = bytes("770A82021980940408010100 0000 9000");
        let message = ApduMessage::parse(Direction::CardToTerminal, &raw)?;
        assert_eq!(message.to_bytes(), raw);
        assert_eq!(message.fields().len(), 2);
        Ok(())
    }
}
