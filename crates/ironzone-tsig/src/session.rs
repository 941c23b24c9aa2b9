use anyhow::Context;
use hmac::digest::MacError;
use hmac::{Hmac, Mac};
use ironzone_lib::{ByteBuf, DnsHeader, FromBuf, RecordType, ResourceData, ResourceRecord, ANY_CLASS};
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};

use crate::{TsigAlgorithm, TsigError, TsigKey};

/// Default fudge window in seconds (RFC 2845 §6)
pub const DEFAULT_FUDGE: u16 = 300;

/// Message-byte offsets used when rebuilding the signed form of a packet
const ID_END: usize = 2;
const ARCOUNT_START: usize = 10;
const ARCOUNT_END: usize = 12;

/// Object-safe wrapper around the `digest` crate's [`Mac`] trait so that
/// algorithm dispatch can go through `Box<dyn Authenticator>`.
trait Authenticator {
    fn update(&mut self, data: &[u8]);
    fn finalize(self: Box<Self>) -> Vec<u8>;
    fn verify_slice(self: Box<Self>, tag: &[u8]) -> Result<(), MacError>;
}

impl<M> Authenticator for M
where
    M: Mac,
{
    fn update(&mut self, data: &[u8]) {
        <Self as Mac>::update(self, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        <Self as Mac>::finalize(*self).into_bytes().to_vec()
    }

    fn verify_slice(self: Box<Self>, tag: &[u8]) -> Result<(), MacError> {
        <Self as Mac>::verify_slice(*self, tag)
    }
}

fn make_authenticator(key: &TsigKey) -> anyhow::Result<Box<dyn Authenticator>> {
    Ok(match key.algorithm {
        TsigAlgorithm::HmacMd5 => Box::new(Hmac::<Md5>::new_from_slice(key.secret()).context("bad HMAC key")?),
        TsigAlgorithm::HmacSha1 => Box::new(Hmac::<Sha1>::new_from_slice(key.secret()).context("bad HMAC key")?),
        TsigAlgorithm::HmacSha224 => Box::new(Hmac::<Sha224>::new_from_slice(key.secret()).context("bad HMAC key")?),
        TsigAlgorithm::HmacSha256 => Box::new(Hmac::<Sha256>::new_from_slice(key.secret()).context("bad HMAC key")?),
        TsigAlgorithm::HmacSha384 => Box::new(Hmac::<Sha384>::new_from_slice(key.secret()).context("bad HMAC key")?),
        TsigAlgorithm::HmacSha512 => Box::new(Hmac::<Sha512>::new_from_slice(key.secret()).context("bad HMAC key")?),
    })
}

fn name_to_wire(name: &str) -> anyhow::Result<Vec<u8>> {
    let mut buf = ByteBuf::new_empty(Some(name.len() + 2));
    buf.write_qname(&name.to_ascii_lowercase(), None)
        .with_context(|| format!("encoding name '{}'", name))?;
    Ok(buf.into_vec())
}

/// Adds the MAC of the previous packet in the chain, length-prefixed
fn add_prior_mac(authenticator: &mut dyn Authenticator, prior_mac: &[u8]) {
    authenticator.update(&(prior_mac.len() as u16).to_be_bytes());
    authenticator.update(prior_mac);
}

/// Adds the TSIG variables (RFC 2845 §3.4.2-3.4.3) to the MAC:
/// key name, class ANY, TTL 0, algorithm name, timers, error and
/// other data. Names go in canonical (lowercase, uncompressed) form.
fn add_tsig_variables(
    authenticator: &mut dyn Authenticator,
    key_name: &str,
    algorithm_name: &str,
    time_signed: u64,
    fudge: u16,
    error: u16,
    other_data: &[u8],
) -> anyhow::Result<()> {
    authenticator.update(&name_to_wire(key_name)?);
    authenticator.update(b"\x00\xff\x00\x00\x00\x00");
    authenticator.update(&name_to_wire(algorithm_name)?);
    authenticator.update(&(time_signed & 0xFFFF_FFFF_FFFF).to_be_bytes()[2..]);
    authenticator.update(&fudge.to_be_bytes());
    authenticator.update(&error.to_be_bytes());
    authenticator.update(&(other_data.len() as u16).to_be_bytes());
    authenticator.update(other_data);
    Ok(())
}

/// The TSIG RR of a received message, in decoded form.
#[derive(Debug, Clone)]
pub struct LocatedTsig {
    /// Byte offset where the TSIG RR starts
    pub offset: usize,
    pub key_name: String,
    pub algorithm_name: String,
    pub time_signed: u64,
    pub fudge: u16,
    pub mac: Vec<u8>,
    pub original_id: u16,
    pub error: u16,
    pub other_data: Vec<u8>,
}

/// Finds and decodes the TSIG RR of a message.
///
/// A TSIG RR anywhere but the very last position of the additional
/// section is rejected.
pub fn locate_tsig(message: &[u8]) -> Result<LocatedTsig, TsigError> {
    let mut buf = ByteBuf::new(&message);
    let header = DnsHeader::from_buf(&mut buf)
        .context("header parsing error")
        .map_err(TsigError::Malformed)?;

    if header.additional_rr_count == 0 {
        return Err(TsigError::NotSigned);
    }

    for idx in 0..header.question_count {
        buf.read_qname()
            .and_then(|_| buf.advance(4))
            .with_context(|| format!("question parsing error at idx {}", idx))
            .map_err(TsigError::Malformed)?;
    }

    let total_rrs =
        header.answer_rr_count as usize + header.authority_rr_count as usize + header.additional_rr_count as usize;

    let mut located = None;
    for idx in 0..total_rrs {
        let offset = buf.pos();
        let rr = ResourceRecord::from_buf(&mut buf)
            .with_context(|| format!("RR parsing error at idx {}", idx))
            .map_err(TsigError::Malformed)?;
        if rr.resource_data.get_record_type() == RecordType::TSIG {
            if idx != total_rrs - 1 {
                return Err(TsigError::NotLast);
            }
            located = Some((offset, rr));
        }
    }

    let (offset, rr) = located.ok_or(TsigError::NotSigned)?;
    let ResourceData::TSIG {
        algorithm_name,
        time_signed,
        fudge,
        mac,
        original_id,
        error,
        other_data,
    } = rr.resource_data
    else {
        unreachable!("record type was checked above");
    };

    Ok(LocatedTsig {
        offset,
        key_name: rr.name.into_owned(),
        algorithm_name: algorithm_name.into_owned(),
        time_signed,
        fudge,
        mac: mac.into_owned(),
        original_id,
        error,
        other_data: other_data.into_owned(),
    })
}

/// Pulls the MAC out of a signed message without verifying it
pub fn extract_mac(message: &[u8]) -> Result<Vec<u8>, TsigError> {
    locate_tsig(message).map(|tsig| tsig.mac)
}

/// Signs a fully encoded message in place: computes the MAC, appends the
/// TSIG RR and bumps ARCOUNT. Returns the MAC for chaining.
///
/// `prior_mac` is `None` when signing a request and `Some` when signing a
/// response (the request's MAC, then the previous response packet's).
pub fn sign_message(
    message: &mut ByteBuf<'_>,
    key: &TsigKey,
    prior_mac: Option<&[u8]>,
    now: u64,
) -> anyhow::Result<Vec<u8>> {
    let mut authenticator = make_authenticator(key)?;
    if let Some(prior_mac) = prior_mac {
        add_prior_mac(authenticator.as_mut(), prior_mac);
    }
    authenticator.update(message);
    add_tsig_variables(
        authenticator.as_mut(),
        &key.name,
        key.algorithm.wire_name(),
        now,
        DEFAULT_FUDGE,
        0,
        &[],
    )?;
    let mac = authenticator.finalize();

    let original_id = message.peek_u16(0).context("message is missing an ID")?;
    let tsig_rr = ResourceRecord::new(
        &key.name,
        ResourceData::TSIG {
            algorithm_name: key.algorithm.wire_name().into(),
            time_signed: now,
            fudge: DEFAULT_FUDGE,
            mac: mac.clone().into(),
            original_id,
            error: 0,
            other_data: std::borrow::Cow::Borrowed(&[]),
        },
        Some(0),
        Some(ANY_CLASS),
    );
    use ironzone_lib::EncodeToBuf;
    tsig_rr.encode_to_buf(message).context("appending TSIG RR")?;

    let arcount = message.peek_u16(ARCOUNT_START).context("message is missing ARCOUNT")?;
    message
        .set_u16(ARCOUNT_START, arcount + 1)
        .context("updating ARCOUNT")?;

    Ok(mac)
}

/// Verifies a signed message against `key`.
///
/// The time check runs before the MAC comparison so that a skewed clock
/// surfaces as `BadTime` instead of a misleading `BadSig`.
pub fn verify_message(
    message: &[u8],
    key: &TsigKey,
    prior_mac: Option<&[u8]>,
    now: u64,
) -> Result<LocatedTsig, TsigError> {
    let tsig = locate_tsig(message)?;

    if !key.matches_name(&tsig.key_name) {
        return Err(TsigError::BadKey(tsig.key_name));
    }
    let algorithm = TsigAlgorithm::from_name(&tsig.algorithm_name)
        .ok_or_else(|| TsigError::BadKey(tsig.algorithm_name.clone()))?;
    if algorithm != key.algorithm {
        return Err(TsigError::BadKey(tsig.key_name));
    }

    if now.abs_diff(tsig.time_signed) > tsig.fudge as u64 {
        return Err(TsigError::BadTime);
    }

    if tsig.mac.len() != algorithm.output_size() {
        return Err(TsigError::BadTrunc);
    }

    if message.len() < DnsHeader::SIZE || tsig.offset > message.len() {
        return Err(TsigError::Malformed(anyhow::anyhow!("TSIG RR offset is out of bounds")));
    }

    let mut authenticator = make_authenticator(key).map_err(TsigError::Malformed)?;
    if let Some(prior_mac) = prior_mac {
        add_prior_mac(authenticator.as_mut(), prior_mac);
    }

    // Rebuild the message as it looked when it was signed: original ID,
    // ARCOUNT without the TSIG RR, everything up to the TSIG RR
    authenticator.update(&tsig.original_id.to_be_bytes());
    authenticator.update(&message[ID_END..ARCOUNT_START]);
    let arcount = u16::from_be_bytes(
        message[ARCOUNT_START..ARCOUNT_END]
            .try_into()
            .unwrap_or_default(),
    );
    authenticator.update(&arcount.saturating_sub(1).to_be_bytes());
    authenticator.update(&message[ARCOUNT_END..tsig.offset]);

    add_tsig_variables(
        authenticator.as_mut(),
        &tsig.key_name,
        &tsig.algorithm_name,
        tsig.time_signed,
        tsig.fudge,
        tsig.error,
        &tsig.other_data,
    )
    .map_err(TsigError::Malformed)?;

    authenticator.verify_slice(&tsig.mac).map_err(|_| TsigError::BadSig)?;

    Ok(tsig)
}

/// MAC chain state for a multi-message signed transfer (RFC 2845 §4.4).
///
/// Packet 0 of a response stream is signed with the request's MAC as the
/// prior MAC; every later packet with the MAC of the packet before it.
/// One session exists per transfer, so concurrent transfers never share
/// chain state.
pub struct SigningSession<'a> {
    key: &'a TsigKey,
    prior_mac: Vec<u8>,
    packet_index: usize,
}

impl<'a> SigningSession<'a> {
    pub fn new(key: &'a TsigKey, request_mac: Vec<u8>) -> Self {
        SigningSession {
            key,
            prior_mac: request_mac,
            packet_index: 0,
        }
    }

    pub fn packet_index(&self) -> usize {
        self.packet_index
    }

    /// Signs the next packet of the stream and advances the chain
    pub fn sign_next(&mut self, message: &mut ByteBuf<'_>, now: u64) -> anyhow::Result<()> {
        let mac = sign_message(message, self.key, Some(&self.prior_mac), now)
            .with_context(|| format!("signing packet {}", self.packet_index))?;
        self.prior_mac = mac;
        self.packet_index += 1;
        Ok(())
    }
}

/// Client-side counterpart of [`SigningSession`]: verifies a signed
/// response stream packet by packet.
pub struct VerifySession<'a> {
    key: &'a TsigKey,
    prior_mac: Vec<u8>,
    packet_index: usize,
}

impl<'a> VerifySession<'a> {
    pub fn new(key: &'a TsigKey, request_mac: Vec<u8>) -> Self {
        VerifySession {
            key,
            prior_mac: request_mac,
            packet_index: 0,
        }
    }

    pub fn packet_index(&self) -> usize {
        self.packet_index
    }

    /// Verifies the next packet of the stream and advances the chain
    pub fn verify_next(&mut self, message: &[u8], now: u64) -> Result<(), TsigError> {
        let tsig = verify_message(message, self.key, Some(&self.prior_mac), now)?;
        self.prior_mac = tsig.mac;
        self.packet_index += 1;
        Ok(())
    }
}
