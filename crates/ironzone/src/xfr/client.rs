use std::time::Duration;

use ironzone_db::ZoneStore;
use ironzone_lib::{
    ByteBuf, DnsPacket, EncodeToBuf as _, FromBuf as _, Question, RecordType, ResourceRecord, ResponseCode,
};
use ironzone_tsig::{sign_message, verify_message, TsigError, TsigKey, VerifySession};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};

use super::{read_framed, send_framed, transaction_id, unix_time, XferError, XferOutcome};

/// Knobs of the inbound transfer client
#[derive(Debug, Clone)]
pub struct XferClientConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Wall-clock budget for the whole transfer
    pub overall_deadline: Duration,
    /// Abort once the response stream grows past this many bytes
    pub max_total_bytes: usize,
    pub tsig_key: Option<TsigKey>,
}

impl Default for XferClientConfig {
    fn default() -> Self {
        XferClientConfig {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            overall_deadline: Duration::from_secs(600),
            max_total_bytes: crate::DEFAULT_MAX_INBOUND_TRANSFER_SIZE,
            tsig_key: None,
        }
    }
}

/// Tries every address the master resolves to until one accepts
async fn connect(master: &str, connect_timeout: Duration) -> Result<TcpStream, XferError> {
    let addrs = lookup_host(master).await.map_err(XferError::Connect)?;

    let mut last_error = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_error = Some(e),
            Err(_) => {
                last_error = Some(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connection to {} timed out", addr),
                ))
            }
        }
    }

    Err(XferError::Connect(last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("'{}' resolved to no addresses", master))
    })))
}

fn encode_query(origin: &str, query_type: RecordType) -> Result<(u16, ByteBuf<'static>), XferError> {
    let mut query = DnsPacket::new();
    query.header.id = transaction_id();
    query.header.question_count = 1;
    query.questions.push(Question::new(origin, query_type, None).into_owned());

    let mut buf = ByteBuf::new_empty(None);
    query.encode_to_buf(&mut buf).map_err(XferError::Parse)?;
    Ok((query.header.id, buf))
}

/// Performs a full inbound zone transfer from `master` and atomically
/// applies the result to `store`.
///
/// The response stream must carry the zone between exactly two copies of
/// the SOA RR; anything else is a protocol error. When a TSIG key is
/// configured, the request is signed and every response packet must
/// continue the MAC chain.
pub async fn transfer_zone<S: ZoneStore>(
    origin: &str,
    master: &str,
    config: &XferClientConfig,
    store: &S,
) -> Result<XferOutcome, XferError> {
    let started = Instant::now();
    let deadline = started + config.overall_deadline;

    let mut stream = connect(master, config.connect_timeout).await?;

    let (query_id, mut query) = encode_query(origin, RecordType::AXFR)?;
    let mut verifier = match config.tsig_key.as_ref() {
        Some(key) => {
            let request_mac = sign_message(&mut query, key, None, unix_time().map_err(XferError::Parse)?)
                .map_err(TsigError::Malformed)?;
            Some(VerifySession::new(key, request_mac))
        }
        None => None,
    };
    send_framed(&mut stream, &query).await?;

    let mut soa: Option<ResourceRecord<'static>> = None;
    let mut records: Vec<ResourceRecord<'static>> = Vec::new();
    let mut records_received = 0;
    let mut bytes_received = 0;
    let mut messages_received = 0;
    let mut complete = false;

    'stream: while !complete {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(XferError::Timeout)?
            .min(config.read_timeout);

        let message = match timeout(remaining, read_framed(&mut stream)).await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(XferError::Parse(anyhow::anyhow!(
                    "the stream ended before the final SOA record"
                )))
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(XferError::Timeout),
        };

        bytes_received += 2 + message.len();
        if bytes_received > config.max_total_bytes {
            return Err(XferError::ResponseTooLarge);
        }
        messages_received += 1;

        if let Some(verifier) = verifier.as_mut() {
            verifier.verify_next(&message, unix_time().map_err(XferError::Parse)?)?;
        }

        let mut reader = ByteBuf::new(&message);
        let packet = DnsPacket::from_buf(&mut reader).map_err(XferError::Parse)?;
        if packet.header.id != query_id {
            return Err(XferError::Parse(anyhow::anyhow!(
                "mismatched message ID: expected {}, got {}",
                query_id,
                packet.header.id
            )));
        }
        if packet.header.response_code != ResponseCode::Success {
            return Err(XferError::Refused(packet.header.response_code));
        }

        for rr in packet.answers {
            records_received += 1;
            let is_soa = rr.resource_data.get_record_type() == RecordType::SOA;
            match (&soa, is_soa) {
                // Leading SOA
                (None, true) => soa = Some(rr),
                (None, false) => {
                    return Err(XferError::Parse(anyhow::anyhow!(
                        "the stream doesn't start with the zone's SOA record"
                    )))
                }
                // Trailing SOA terminates the transfer
                (Some(leading), true) => {
                    if complete {
                        return Err(XferError::Parse(anyhow::anyhow!(
                            "more than two SOA records in the stream"
                        )));
                    }
                    if leading.resource_data != rr.resource_data {
                        return Err(XferError::Parse(anyhow::anyhow!(
                            "the trailing SOA record doesn't match the leading one"
                        )));
                    }
                    complete = true;
                }
                (Some(_), false) => {
                    if complete {
                        return Err(XferError::Parse(anyhow::anyhow!("records after the final SOA record")));
                    }
                    records.push(rr);
                }
            }
        }
        if complete {
            break 'stream;
        }
    }

    let soa = soa.ok_or_else(|| XferError::Parse(anyhow::anyhow!("empty transfer stream")))?;
    let new_serial = soa_serial(&soa).map_err(XferError::Parse)?;

    let counts = store.replace_zone(&soa, &records).await.map_err(XferError::Store)?;

    Ok(XferOutcome {
        origin: origin.to_owned(),
        new_serial,
        records_received,
        records_added: counts.added,
        records_updated: counts.updated,
        records_deleted: counts.deleted,
        bytes_received,
        messages_received,
        duration: started.elapsed(),
    })
}

/// What an incremental transfer attempt amounted to
#[derive(Debug)]
pub enum IxfrResponse {
    /// The master confirmed our copy is current
    UpToDate,
    /// A delta or a full zone arrived and was applied
    Applied(XferOutcome),
    /// The master can't serve a usable delta, retry with a full transfer
    FallBack,
}

/// Asks `master` for the changes since our copy of the zone (RFC 1995)
/// and applies them to `store`.
///
/// The whole response must fit into a single signed message; anything the
/// client can't make sense of turns into `FallBack` so the caller can fall
/// back to a full transfer.
pub async fn try_incremental_transfer<S: ZoneStore>(
    origin: &str,
    master: &str,
    local_soa: &ResourceRecord<'static>,
    config: &XferClientConfig,
    store: &S,
) -> Result<IxfrResponse, XferError> {
    let started = Instant::now();
    let local_serial = soa_serial(local_soa).map_err(XferError::Parse)?;

    let mut query = DnsPacket::new();
    query.header.id = transaction_id();
    query.header.question_count = 1;
    query.questions.push(Question::new(origin, RecordType::IXFR, None).into_owned());
    query.header.authority_rr_count = 1;
    query.authorities.push(local_soa.clone());

    let mut buf = ByteBuf::new_empty(None);
    query.encode_to_buf(&mut buf).map_err(XferError::Parse)?;
    let request_mac = match config.tsig_key.as_ref() {
        Some(key) => Some(
            sign_message(&mut buf, key, None, unix_time().map_err(XferError::Parse)?)
                .map_err(TsigError::Malformed)?,
        ),
        None => None,
    };

    let mut stream = connect(master, config.connect_timeout).await?;
    send_framed(&mut stream, &buf).await?;

    let message = match timeout(config.read_timeout, read_framed(&mut stream)).await {
        Ok(result) => result?,
        Err(_) => return Err(XferError::Timeout),
    };
    if 2 + message.len() > config.max_total_bytes {
        return Err(XferError::ResponseTooLarge);
    }

    if let (Some(key), Some(request_mac)) = (config.tsig_key.as_ref(), request_mac) {
        verify_message(&message, key, Some(&request_mac), unix_time().map_err(XferError::Parse)?)?;
    }

    let mut reader = ByteBuf::new(&message);
    let packet = DnsPacket::from_buf(&mut reader).map_err(XferError::Parse)?;
    if packet.header.id != query.header.id {
        return Err(XferError::Parse(anyhow::anyhow!("mismatched message ID")));
    }
    if packet.header.response_code != ResponseCode::Success {
        tracing::debug!(
            origin,
            master,
            response_code = ?packet.header.response_code,
            "the master won't serve an incremental transfer"
        );
        return Ok(IxfrResponse::FallBack);
    }

    let answers: Vec<ResourceRecord<'static>> = packet.answers.into_iter().map(|rr| rr.into_owned()).collect();
    let Some(leading) = answers.first() else {
        return Err(XferError::Parse(anyhow::anyhow!("empty transfer response")));
    };
    if leading.resource_data.get_record_type() != RecordType::SOA {
        return Err(XferError::Parse(anyhow::anyhow!(
            "the response doesn't start with the zone's SOA record"
        )));
    }
    let new_serial = soa_serial(leading).map_err(XferError::Parse)?;

    if answers.len() == 1 {
        if new_serial == local_serial {
            return Ok(IxfrResponse::UpToDate);
        }
        // A lone SOA with a different serial is the master's way of saying
        // it can't help us incrementally
        return Ok(IxfrResponse::FallBack);
    }

    let records = if answers[1].resource_data.get_record_type() == RecordType::SOA {
        apply_delta(origin, &answers, store).await?
    } else {
        // Not a delta but the whole zone between two copies of the SOA
        let trailing = answers.last().filter(|rr| rr.resource_data == leading.resource_data);
        if trailing.is_none() {
            return Err(XferError::Parse(anyhow::anyhow!(
                "the trailing SOA record doesn't match the leading one"
            )));
        }
        answers[1..answers.len() - 1].to_vec()
    };

    let new_soa = leading.clone();
    let counts = store.replace_zone(&new_soa, &records).await.map_err(XferError::Store)?;

    Ok(IxfrResponse::Applied(XferOutcome {
        origin: origin.to_owned(),
        new_serial,
        records_received: answers.len(),
        records_added: counts.added,
        records_updated: counts.updated,
        records_deleted: counts.deleted,
        bytes_received: 2 + message.len(),
        messages_received: 1,
        duration: started.elapsed(),
    }))
}

/// Replays an RFC 1995 delta over our current copy of the zone. Every SOA
/// after the leading one toggles between the deletion and the addition
/// half of a change set.
async fn apply_delta<S: ZoneStore>(
    origin: &str,
    answers: &[ResourceRecord<'static>],
    store: &S,
) -> Result<Vec<ResourceRecord<'static>>, XferError> {
    enum Mode {
        Deleting,
        Adding,
    }

    let mut working = store.load_records(origin).await.map_err(XferError::Store)?;
    let mut mode = Mode::Adding;
    for rr in &answers[1..] {
        if rr.resource_data.get_record_type() == RecordType::SOA {
            mode = match mode {
                Mode::Adding => Mode::Deleting,
                Mode::Deleting => Mode::Adding,
            };
            continue;
        }
        match mode {
            Mode::Deleting => {
                let position = working.iter().position(|have| {
                    have.name.eq_ignore_ascii_case(&rr.name) && have.resource_data == rr.resource_data
                });
                match position {
                    Some(position) => {
                        working.remove(position);
                    }
                    None => tracing::debug!(origin, name = %rr.name, "delta deletes a record we don't have"),
                }
            }
            Mode::Adding => working.push(rr.clone()),
        }
    }

    Ok(working)
}

/// Asks `master` for the zone's SOA over UDP and returns the serial it
/// advertises, if any
pub async fn check_serial(origin: &str, master: &str, config: &XferClientConfig) -> Result<Option<u32>, XferError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(master).await.map_err(XferError::Connect)?;

    let (query_id, mut query) = encode_query(origin, RecordType::SOA)?;
    let request_mac = match config.tsig_key.as_ref() {
        Some(key) => Some(
            sign_message(&mut query, key, None, unix_time().map_err(XferError::Parse)?)
                .map_err(TsigError::Malformed)?,
        ),
        None => None,
    };
    socket.send(&query).await?;

    let mut response = vec![0; ironzone_lib::MAX_MESSAGE_SIZE];
    let received = match timeout(config.read_timeout, socket.recv(&mut response)).await {
        Ok(result) => result?,
        Err(_) => return Err(XferError::Timeout),
    };
    response.truncate(received);

    if let (Some(key), Some(request_mac)) = (config.tsig_key.as_ref(), request_mac) {
        verify_message(
            &response,
            key,
            Some(&request_mac),
            unix_time().map_err(XferError::Parse)?,
        )?;
    }

    let mut reader = ByteBuf::new(&response);
    let packet = DnsPacket::from_buf(&mut reader).map_err(XferError::Parse)?;
    if packet.header.id != query_id {
        return Err(XferError::Parse(anyhow::anyhow!("mismatched message ID")));
    }
    if packet.header.response_code != ResponseCode::Success {
        return Ok(None);
    }

    Ok(packet
        .answers
        .iter()
        .find(|rr| rr.resource_data.get_record_type() == RecordType::SOA)
        .map(|rr| soa_serial(rr))
        .transpose()
        .map_err(XferError::Parse)?)
}

fn soa_serial(rr: &ResourceRecord<'_>) -> anyhow::Result<u32> {
    let ironzone_lib::ResourceData::SOA { serial, .. } = &rr.resource_data else {
        anyhow::bail!("record '{}' is not a SOA", rr.name);
    };
    Ok(*serial)
}
