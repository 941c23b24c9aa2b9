use std::collections::HashMap;

use anyhow::Context;

use crate::{ByteBuf, EncodeToBuf, FromBuf};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Opcode {
    /// Standard query
    #[default]
    Query,
    /// Zone change notification (RFC 1996)
    Notify,
    /// Everything else
    Unknown,
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        match value {
            0 => Opcode::Query,
            4 => Opcode::Notify,
            _ => Opcode::Unknown,
        }
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        match value {
            Opcode::Query => 0,
            Opcode::Notify => 4,
            Opcode::Unknown => 3,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum ResponseCode {
    #[default]
    Success,
    /// Server was unable to interpret the query
    FormatError,
    /// Internal error while processing the query
    ServerFailure,
    /// Domain name referenced in the query doesn't exist
    NameError,
    /// Requested operation is not supported by the server
    NotImplemented,
    /// Server refuses to complete the specified operation
    Refused,
    /// Server is not authoritative for the zone (RFC 2136/2845)
    NotAuth,
    /// 6-8 and 10-15 codes
    Unknown,
}

impl From<u8> for ResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0 => ResponseCode::Success,
            1 => ResponseCode::FormatError,
            2 => ResponseCode::ServerFailure,
            3 => ResponseCode::NameError,
            4 => ResponseCode::NotImplemented,
            5 => ResponseCode::Refused,
            9 => ResponseCode::NotAuth,
            _ => ResponseCode::Unknown,
        }
    }
}

impl From<ResponseCode> for u8 {
    fn from(value: ResponseCode) -> Self {
        match value {
            ResponseCode::Success => 0,
            ResponseCode::FormatError => 1,
            ResponseCode::ServerFailure => 2,
            ResponseCode::NameError => 3,
            ResponseCode::NotImplemented => 4,
            ResponseCode::Refused => 5,
            ResponseCode::NotAuth => 9,
            ResponseCode::Unknown => 15,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Default, Clone)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct DnsHeader {
    /// Unique ID of this request.
    /// A query and its response **must have the same ID**.
    pub id: u16,
    /// Query/Response
    pub is_response: bool,
    /// Kind of query
    pub opcode: Opcode,
    /// Set by the server. Indicates whether it is authoritative for the zone
    pub is_authoritative: bool,
    /// Set if the packet was truncated to fit into UDP
    pub truncation: bool,
    /// Set by the sender. Enables recursive resolution
    pub recursion_desired: bool,
    /// Set by the server. Indicates whether recursion is allowed
    pub recursion_available: bool,
    /// Reserved bits
    pub z: [bool; 3],
    /// Set by the server. Indicates status of the response
    pub response_code: ResponseCode,
    /// Number of entries in the *Question* section
    pub question_count: u16,
    /// Number of entries in the *Answer* section
    pub answer_rr_count: u16,
    /// Number of entries in the *Authority* section
    pub authority_rr_count: u16,
    /// Number of entries in the *Additional* section
    pub additional_rr_count: u16,
}

impl DnsHeader {
    pub const SIZE: usize = 12;

    pub fn new() -> Self {
        DnsHeader::default()
    }

    pub fn get_flags(&self) -> u16 {
        let first_byte = (self.is_response as u8) << 7
            | u8::from(self.opcode) << 3
            | (self.is_authoritative as u8) << 2
            | (self.truncation as u8) << 1
            | self.recursion_desired as u8;
        let second_byte = (self.recursion_available as u8) << 7
            | (self.z[0] as u8) << 6
            | (self.z[1] as u8) << 5
            | (self.z[2] as u8) << 4
            | u8::from(self.response_code);
        (first_byte as u16) << 8 | (second_byte as u16)
    }
}

impl FromBuf for DnsHeader {
    fn from_buf(buf: &mut ByteBuf) -> anyhow::Result<Self> {
        let id = buf.read_u16().context("id is missing")?;
        let flags = buf.read_u16().context("flags are missing")?;

        let is_response = ((flags & 0x8000) >> 15) == 1;
        let opcode: Opcode = (((flags & 0x7800) >> 11) as u8).into();
        let is_authoritative = ((flags & 0x400) >> 10) == 1;
        let truncation = ((flags & 0x200) >> 9) == 1;
        let recursion_desired = ((flags & 0x100) >> 8) == 1;
        let recursion_available = ((flags & 0x80) >> 7) == 1;
        let z = {
            let bit_1 = ((flags & 0x40) >> 6) == 1;
            let bit_2 = ((flags & 0x20) >> 5) == 1;
            let bit_3 = ((flags & 0x10) >> 4) == 1;
            [bit_1, bit_2, bit_3]
        };
        let response_code: ResponseCode = ((flags & 0xf) as u8).into();
        let question_count = buf.read_u16().context("question count is missing")?;
        let answer_rr_count = buf.read_u16().context("answer RR count is missing")?;
        let authority_rr_count = buf.read_u16().context("authority RR count is missing")?;
        let additional_rr_count = buf.read_u16().context("additional RR count is missing")?;

        Ok(DnsHeader {
            id,
            is_response,
            opcode,
            is_authoritative,
            truncation,
            recursion_desired,
            recursion_available,
            z,
            response_code,
            question_count,
            answer_rr_count,
            authority_rr_count,
            additional_rr_count,
        })
    }
}

impl EncodeToBuf for DnsHeader {
    fn encode_to_buf_with_cache<'cache, 'r: 'cache>(
        &'r self,
        buf: &mut ByteBuf,
        _label_cache: Option<&mut HashMap<&'cache str, usize>>,
    ) -> anyhow::Result<usize> {
        buf.write_u16(self.id);
        buf.write_u16(self.get_flags());
        buf.write_u16(self.question_count);
        buf.write_u16(self.answer_rr_count);
        buf.write_u16(self.authority_rr_count);
        buf.write_u16(self.additional_rr_count);

        Ok(DnsHeader::SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn dns_header_parsing() {
        let stub_header = &mut [0x0, 0xff, 0x25, 0xa9, 0x0, 0x6, 0x0, 0x7, 0x0, 0x8, 0x0, 0x9];
        let mut buf = ByteBuf::new(stub_header);
        let header = DnsHeader::from_buf(&mut buf).expect("shouldn't have failed");

        assert_eq!(header.id, 255);
        assert!(!header.is_response);
        assert_eq!(header.opcode, Opcode::Notify);
        assert!(header.is_authoritative);
        assert!(!header.truncation);
        assert!(header.recursion_desired);
        assert!(header.recursion_available);
        assert!(!header.z[0]);
        assert!(header.z[1]);
        assert!(!header.z[2]);
        assert_eq!(header.response_code, ResponseCode::NotAuth);
        assert_eq!(header.question_count, 6);
        assert_eq!(header.answer_rr_count, 7);
        assert_eq!(header.authority_rr_count, 8);
        assert_eq!(header.additional_rr_count, 9);
    }

    proptest! {
        #[test]
        fn dns_header_roundtrip(dns_header: DnsHeader) {
            let mut buf = ByteBuf::new_empty(None);
            dns_header.encode_to_buf(&mut buf).expect("shouldn't have failed");
            let roundtripped_header = DnsHeader::from_buf(&mut buf).expect("shouldn't have failed");
            prop_assert_eq!(dns_header, roundtripped_header, "DnsHeader roundtrip test failed");
        }
    }
}
