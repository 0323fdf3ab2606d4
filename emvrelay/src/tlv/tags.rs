//! Data objects the relay looks at. Everything else passes through as opaque nodes.

use super::Tag;

// ref. EMV Book 1, 11.3.4 Data Field Returned in the Response Message (SELECT)
pub const FCI_TEMPLATE: Tag = Tag::short(0x6F);
pub const DF_NAME: Tag = Tag::short(0x84);
pub const APPLICATION_LABEL: Tag = Tag::short(0x50);

// ref. EMV Book 3, 6.5.8.4 GET PROCESSING OPTIONS response
pub const RESPONSE_FORMAT_1: Tag = Tag::short(0x80);
pub const RESPONSE_TEMPLATE: Tag = Tag::short(0x77);
pub const COMMAND_TEMPLATE: Tag = Tag::short(0x83);
pub const AIP: Tag = Tag::short(0x82);
pub const AFL: Tag = Tag::short(0x94);

// READ RECORD
pub const RECORD_TEMPLATE: Tag = Tag::short(0x70);
pub const TRACK2: Tag = Tag::short(0x57);
pub const PAN: Tag = Tag::short(0x5A);
pub const EXPIRY_DATE: Tag = Tag::long(0x5F, 0x24);
pub const PAN_SEQUENCE_NUMBER: Tag = Tag::long(0x5F, 0x34);
pub const CDOL1: Tag = Tag::short(0x8C);

// ref. EMV Book 3, 6.5.5.4 GENERATE AC response
pub const CRYPTOGRAM_INFORMATION_DATA: Tag = Tag::long(0x9F, 0x27);
pub const ATC: Tag = Tag::long(0x9F, 0x36);
pub const APPLICATION_CRYPTOGRAM: Tag = Tag::long(0x9F, 0x26);
pub const ISSUER_APPLICATION_DATA: Tag = Tag::long(0x9F, 0x10);
