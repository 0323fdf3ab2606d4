//! EMV flavoured BER-TLV codec.
//!
//! Decoded trees are immutable: every modification goes through [`replace`] or
//! [`TlvNode::with_child`] and yields a new tree, so that a message shared between the
//! pipeline and a pending injection can never be changed underneath either of them.
//!
//! ref. EMV Book 3, Annex B: Rules for BER-TLV Data Objects

use iso7816_tlv::ber;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

use crate::error::{RelayError, Result};
use crate::{get_truncated_pan, EmvTag, FieldSensitivity, TagDictionary};

pub mod tags;

/// A BER tag of at most three bytes. Serialized as its hex name, e.g. `"9F36"`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag {
    bytes: [u8; 3],
    len: u8,
}

impl Tag {
    pub const fn short(b1: u8) -> Tag {
        Tag {
            bytes: [b1, 0, 0],
            len: 1,
        }
    }

    pub const fn long(b1: u8, b2: u8) -> Tag {
        Tag {
            bytes: [b1, b2, 0],
            len: 2,
        }
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Tag> {
        if raw.is_empty() || raw.len() > 3 {
            return Err(RelayError::malformed_tlv(
                0,
                format!("tag of {} bytes", raw.len()),
            ));
        }

        let (tag, used) = take_tag(raw, 0)?;
        if used != raw.len() {
            return Err(RelayError::malformed_tlv(used, "trailing bytes after tag"));
        }

        Ok(tag)
    }

    pub fn from_hex(tag_name: &str) -> Result<Tag> {
        Tag::from_bytes(&hex::decode(tag_name)?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Bit 6 of the first byte, see EMV Book 3, Annex B1.
    pub fn is_constructed(&self) -> bool {
        self.bytes[0] & 0b0010_0000 != 0
    }

    pub fn name(&self) -> String {
        hex::encode_upper(self.as_bytes())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl TryFrom<String> for Tag {
    type Error = RelayError;

    fn try_from(tag_name: String) -> Result<Tag> {
        Tag::from_hex(&tag_name)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> String {
        tag.name()
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Tag({})", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvValue {
    Primitive(Vec<u8>),
    Constructed(Vec<TlvNode>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvNode {
    tag: Tag,
    value: TlvValue,
}

impl TlvNode {
    pub fn primitive(tag: Tag, value: impl Into<Vec<u8>>) -> TlvNode {
        TlvNode {
            tag,
            value: TlvValue::Primitive(value.into()),
        }
    }

    pub fn constructed(tag: Tag, children: Vec<TlvNode>) -> TlvNode {
        TlvNode {
            tag,
            value: TlvValue::Constructed(children),
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn value(&self) -> &TlvValue {
        &self.value
    }

    /// Primitive value bytes, `None` for templates.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.value {
            TlvValue::Primitive(v) => Some(&v[..]),
            TlvValue::Constructed(_) => None,
        }
    }

    pub fn children(&self) -> &[TlvNode] {
        match &self.value {
            TlvValue::Constructed(children) => &children[..],
            TlvValue::Primitive(_) => &[],
        }
    }

    /// Byte length of the encoded value field. Always derived, never stored, so the
    /// length written by [`encode`] cannot disagree with the value.
    pub fn length(&self) -> usize {
        match &self.value {
            TlvValue::Primitive(v) => v.len(),
            TlvValue::Constructed(children) => children.iter().map(|c| c.encoded_len()).sum(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        let length = self.length();
        self.tag.as_bytes().len() + encode_length(length).len() + length
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut output = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut output);
        output
    }

    fn encode_into(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(self.tag.as_bytes());
        output.extend_from_slice(&encode_length(self.length()));
        match &self.value {
            TlvValue::Primitive(v) => output.extend_from_slice(&v[..]),
            TlvValue::Constructed(children) => {
                for child in children {
                    child.encode_into(output);
                }
            }
        }
    }

    /// Depth first search, including this node.
    pub fn find(&self, tag: Tag) -> Option<&TlvNode> {
        if self.tag == tag {
            return Some(self);
        }

        find(self.children(), tag)
    }

    /// Copy of this template with `child` appended.
    pub fn with_child(&self, child: TlvNode) -> TlvNode {
        let mut children = self.children().to_vec();
        children.push(child);
        TlvNode::constructed(self.tag, children)
    }
}

pub fn find(nodes: &[TlvNode], tag: Tag) -> Option<&TlvNode> {
    for node in nodes {
        if let Some(found) = node.find(tag) {
            return Some(found);
        }
    }

    None
}

/// Returns a new tree where the first node carrying `replacement`'s tag is swapped out.
/// Untouched subtrees are cloned as they are, unknown tags included.
pub fn replace(nodes: &[TlvNode], replacement: &TlvNode) -> Option<Vec<TlvNode>> {
    let mut replaced = false;
    let output = nodes
        .iter()
        .map(|node| {
            if replaced {
                node.clone()
            } else {
                let (node, hit) = replace_in(node, replacement);
                replaced = hit;
                node
            }
        })
        .collect();

    if replaced {
        Some(output)
    } else {
        None
    }
}

fn replace_in(node: &TlvNode, replacement: &TlvNode) -> (TlvNode, bool) {
    if node.tag == replacement.tag {
        return (replacement.clone(), true);
    }

    match &node.value {
        TlvValue::Constructed(children) => match replace(children, replacement) {
            Some(children) => (TlvNode::constructed(node.tag, children), true),
            None => (node.clone(), false),
        },
        TlvValue::Primitive(_) => (node.clone(), false),
    }
}

fn take_tag(data: &[u8], offset: usize) -> Result<(Tag, usize)> {
    let first = data[offset];
    if first & 0b0001_1111 != 0b0001_1111 {
        return Ok((Tag::short(first), 1));
    }

    let mut tag_len = 1;
    loop {
        let position = offset + tag_len;
        if position >= data.len() {
            return Err(RelayError::malformed_tlv(position, "truncated tag"));
        }
        if tag_len == 1 && data[position] == 0x80 {
            return Err(RelayError::malformed_tlv(
                position,
                "non-canonical tag: leading zero subsequent byte",
            ));
        }

        tag_len += 1;
        if data[position] & 0b1000_0000 == 0 {
            break;
        }
        if tag_len == 3 {
            return Err(RelayError::malformed_tlv(offset, "tag longer than 3 bytes"));
        }
    }

    let raw = &data[offset..offset + tag_len];
    let tag_name = hex::encode_upper(raw);
    if ber::Tag::try_from(tag_name.as_str()).is_err() {
        return Err(RelayError::malformed_tlv(
            offset,
            format!("non-canonical tag {:02X?}", raw),
        ));
    }

    let mut bytes = [0u8; 3];
    bytes[..tag_len].copy_from_slice(raw);
    Ok((
        Tag {
            bytes,
            len: tag_len as u8,
        },
        tag_len,
    ))
}

// Length forms accepted: short (< 0x80), 0x81 XX and 0x82 XX XX. Non-minimal long forms
// are tolerated on decode; encode always writes the minimal form.
fn take_length(data: &[u8], offset: usize) -> Result<(usize, usize)> {
    if offset >= data.len() {
        return Err(RelayError::malformed_tlv(offset, "missing length"));
    }

    let first = data[offset];
    if first < 0x80 {
        return Ok((first as usize, 1));
    }

    let length_bytes = match first {
        0x81 => 1,
        0x82 => 2,
        _ => {
            return Err(RelayError::malformed_tlv(
                offset,
                format!("unsupported length form {:02X}", first),
            ))
        }
    };

    if offset + length_bytes >= data.len() {
        return Err(RelayError::malformed_tlv(offset, "truncated length field"));
    }

    let length = data[offset + 1..offset + 1 + length_bytes]
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | *b as usize);

    Ok((length, 1 + length_bytes))
}

fn encode_length(length: usize) -> Vec<u8> {
    if length < 0x80 {
        vec![length as u8]
    } else if length <= 0xFF {
        vec![0x81, length as u8]
    } else {
        vec![0x82, (length >> 8) as u8, length as u8]
    }
}

// EMV templates nest a handful of levels at most, e.g. 6F / A5 / BF0C / 61
const MAX_DEPTH: usize = 16;

pub fn decode(data: &[u8]) -> Result<Vec<TlvNode>> {
    decode_at(data, 0, 0)
}

fn decode_at(data: &[u8], base_offset: usize, depth: usize) -> Result<Vec<TlvNode>> {
    let mut nodes = Vec::new();
    let mut position = 0;

    while position < data.len() {
        // ref. EMV Book 3, Annex B: 00 padding may precede, follow or sit between data objects
        if data[position] == 0x00 {
            position += 1;
            continue;
        }

        let (tag, tag_len) = take_tag(data, position)
            .map_err(|e| shift_offset(e, base_offset))?;
        position += tag_len;

        let (length, length_len) = take_length(data, position)
            .map_err(|e| shift_offset(e, base_offset))?;
        position += length_len;

        let remaining = data.len() - position;
        if length > remaining {
            return Err(RelayError::malformed_tlv(
                base_offset + position,
                format!(
                    "tag {} length {} exceeds remaining {} bytes",
                    tag, length, remaining
                ),
            ));
        }

        let value = &data[position..position + length];
        let node = if tag.is_constructed() {
            if depth + 1 >= MAX_DEPTH {
                return Err(RelayError::malformed_tlv(
                    base_offset + position,
                    format!("template {} nested deeper than {} levels", tag, MAX_DEPTH),
                ));
            }
            TlvNode::constructed(tag, decode_at(value, base_offset + position, depth + 1)?)
        } else {
            TlvNode::primitive(tag, value.to_vec())
        };
        position += length;

        nodes.push(node);
    }

    Ok(nodes)
}

fn shift_offset(err: RelayError, base_offset: usize) -> RelayError {
    match err {
        RelayError::MalformedTlv { offset, reason } => RelayError::MalformedTlv {
            offset: offset + base_offset,
            reason,
        },
        other => other,
    }
}

pub fn encode(nodes: &[TlvNode]) -> Vec<u8> {
    let mut output = Vec::new();
    for node in nodes {
        node.encode_into(&mut output);
    }
    output
}

fn print_tag(emv_tag: &EmvTag, level: u8) {
    let padding = " ".repeat(level as usize);
    debug!("{}-{}: {}", padding, emv_tag.tag, emv_tag.name);
}

fn print_tag_value(emv_tag: Option<&EmvTag>, v: &[u8], level: u8, censor: bool) {
    let padding = " ".repeat(level as usize);

    let sensitivity = emv_tag.and_then(|t| t.sensitivity);
    match sensitivity {
        Some(FieldSensitivity::PrimaryAccountNumber) if censor => {
            let pan = hex::encode_upper(v).replace('F', "");
            debug!("{}-data: {}", padding, get_truncated_pan(&pan));
        }
        Some(FieldSensitivity::Public) | None => {
            debug!("{}-data: {:02X?}", padding, v);
        }
        Some(_) if censor => {
            debug!("{}-data: <{} bytes censored>", padding, v.len());
        }
        Some(_) => {
            debug!("{}-data: {:02X?}", padding, v);
        }
    }
}

/// Logs a decoded tree with tag names from the dictionary.
pub fn log_tree(nodes: &[TlvNode], dictionary: &TagDictionary, censor: bool) {
    log_level(nodes, dictionary, censor, 0);
}

fn log_level(nodes: &[TlvNode], dictionary: &TagDictionary, censor: bool, level: u8) {
    for node in nodes {
        let tag_name = node.tag().name();
        let emv_tag = dictionary.get(&tag_name);
        match emv_tag {
            Some(emv_tag) => print_tag(emv_tag, level),
            None => print_tag(&EmvTag::new(&tag_name), level),
        }

        match node.value() {
            TlvValue::Constructed(children) => {
                log_level(children, dictionary, censor, level + 1);
            }
            TlvValue::Primitive(v) => print_tag_value(emv_tag, v, level, censor),
        }
    }

    if level == 0 {
        trace!("{} top level data objects", nodes.len());
    }
}
