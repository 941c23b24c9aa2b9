#[cfg(test)]
pub(crate) mod test_utils;

mod buf;
mod header;
mod question;
mod record;

use std::collections::HashMap;

use anyhow::Context;
pub use buf::{ByteBuf, EncodeToBuf, FromBuf};
pub use header::{DnsHeader, Opcode, ResponseCode};
pub use question::{Question, RecordType};
pub use record::{ResourceData, ResourceRecord};

pub const IN_CLASS: u16 = 1;
pub const ANY_CLASS: u16 = 255;

/// Largest DNS message that fits behind a TCP two-byte length prefix
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct DnsPacket<'a> {
    pub header: DnsHeader,
    pub questions: Vec<Question<'a>>,
    pub answers: Vec<ResourceRecord<'a>>,
    pub authorities: Vec<ResourceRecord<'a>>,
    pub additionals: Vec<ResourceRecord<'a>>,
}

impl<'a> DnsPacket<'a> {
    pub fn new() -> Self {
        DnsPacket::default()
    }

    /// Creates a response shell that echoes the query's ID and question.
    pub fn response_to(query: &DnsPacket<'a>, response_code: ResponseCode) -> DnsPacket<'a> {
        let mut packet = DnsPacket::new();
        packet.header.id = query.header.id;
        packet.header.is_response = true;
        packet.header.opcode = query.header.opcode;
        packet.header.is_authoritative = true;
        packet.header.response_code = response_code;
        packet.questions = query.questions.clone();
        packet.header.question_count = packet.questions.len() as u16;
        packet
    }

    /// Index of the TSIG RR, which must be the last RR in the additional
    /// section if present at all.
    pub fn tsig_rr_idx(&self) -> Option<usize> {
        let idx = self
            .additionals
            .iter()
            .position(|rr| rr.resource_data.get_record_type() == RecordType::TSIG)?;
        (idx == self.additionals.len() - 1).then_some(idx)
    }
}

impl FromBuf for DnsPacket<'_> {
    fn from_buf(buf: &mut ByteBuf<'_>) -> anyhow::Result<DnsPacket<'static>> {
        let header = DnsHeader::from_buf(buf).context("header parsing error")?;

        let mut questions = Vec::with_capacity(header.question_count as usize);
        for idx in 0..header.question_count {
            let question =
                Question::from_buf(buf).with_context(|| format!("question parsing error at idx {}", idx))?;
            questions.push(question);
        }

        let mut answers = Vec::with_capacity(header.answer_rr_count as usize);
        for idx in 0..header.answer_rr_count {
            let answer =
                ResourceRecord::from_buf(buf).with_context(|| format!("answer RR parsing error at idx {}", idx))?;
            answers.push(answer);
        }

        let mut authorities = Vec::with_capacity(header.authority_rr_count as usize);
        for idx in 0..header.authority_rr_count {
            let authority =
                ResourceRecord::from_buf(buf).with_context(|| format!("authority RR parsing error at idx {}", idx))?;
            authorities.push(authority);
        }

        let mut additionals = Vec::with_capacity(header.additional_rr_count as usize);
        for idx in 0..header.additional_rr_count {
            let additional =
                ResourceRecord::from_buf(buf).with_context(|| format!("additional RR parsing error at idx {}", idx))?;
            additionals.push(additional);
        }

        Ok(DnsPacket {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }
}

impl EncodeToBuf for DnsPacket<'_> {
    fn encode_to_buf_with_cache<'cache, 'r: 'cache>(
        &'r self,
        buf: &mut ByteBuf,
        mut label_cache: Option<&mut HashMap<&'cache str, usize>>,
    ) -> anyhow::Result<usize> {
        let start = buf.len();

        self.header.encode_to_buf(buf).context("writing header")?;

        self.questions.iter().enumerate().try_for_each(|(idx, question)| {
            question
                .encode_to_buf_with_cache(buf, label_cache.as_deref_mut())
                .with_context(|| format!("writing question at idx {}", idx))
                .map(drop)
        })?;

        self.answers.iter().enumerate().try_for_each(|(idx, answer)| {
            answer
                .encode_to_buf_with_cache(buf, label_cache.as_deref_mut())
                .with_context(|| format!("writing answer RR at idx {}", idx))
                .map(drop)
        })?;

        self.authorities.iter().enumerate().try_for_each(|(idx, authority)| {
            authority
                .encode_to_buf_with_cache(buf, label_cache.as_deref_mut())
                .with_context(|| format!("writing authority RR at idx {}", idx))
                .map(drop)
        })?;

        self.additionals.iter().enumerate().try_for_each(|(idx, additional)| {
            additional
                .encode_to_buf_with_cache(buf, label_cache.as_deref_mut())
                .with_context(|| format!("writing additional RR at idx {}", idx))
                .map(drop)
        })?;

        Ok(buf.len() - start)
    }

    fn encode_to_buf(&self, buf: &mut ByteBuf) -> anyhow::Result<usize> {
        let mut label_cache = HashMap::new();
        self.encode_to_buf_with_cache(buf, Some(&mut label_cache))
    }
}
