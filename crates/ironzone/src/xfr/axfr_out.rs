use anyhow::Context as _;
use ironzone_db::ZoneStore;
use ironzone_lib::{DnsPacket, ResponseCode};
use ironzone_tsig::{SigningSession, TsigKey};
use tokio::net::TcpStream;

use super::{send_packet, ServeStats};

/// Streams a full zone to the peer (RFC 5936).
///
/// The first message carries the question and the leading SOA; every
/// record then goes out in its own message and a trailing SOA closes the
/// stream. With a TSIG session every message continues the MAC chain.
pub async fn serve_axfr<S: ZoneStore>(
    stream: &mut TcpStream,
    query: &DnsPacket<'_>,
    tsig: Option<(&TsigKey, Vec<u8>)>,
    store: &S,
) -> anyhow::Result<ServeStats> {
    let question = query.questions.first().context("bug: question was validated before")?;
    let origin = question.qname.as_ref();

    let Some(zone) = store.load_zone(origin).await? else {
        super::send_error(stream, query, ResponseCode::Refused).await?;
        return Ok(ServeStats::refused());
    };
    let records = store
        .load_records(origin)
        .await
        .with_context(|| format!("loading records of zone '{}'", origin))?;

    let mut signer = tsig.map(|(key, request_mac)| SigningSession::new(key, request_mac));
    let soa_rr = zone.to_wire();

    // Leading SOA, question included
    let mut first = DnsPacket::response_to(query, ResponseCode::Success);
    first.header.answer_rr_count = 1;
    first.answers.push(soa_rr.clone());
    send_packet(stream, &first, signer.as_mut()).await?;

    // One record per message, without the question
    let mut records_sent = 1;
    for rr in &records {
        let mut message = DnsPacket::new();
        message.header.id = query.header.id;
        message.header.is_response = true;
        message.header.is_authoritative = true;
        message.header.answer_rr_count = 1;
        message.answers.push(rr.clone());
        send_packet(stream, &message, signer.as_mut()).await?;
        records_sent += 1;
    }

    // Trailing SOA closes the stream
    let mut last = DnsPacket::new();
    last.header.id = query.header.id;
    last.header.is_response = true;
    last.header.is_authoritative = true;
    last.header.answer_rr_count = 1;
    last.answers.push(soa_rr);
    send_packet(stream, &last, signer.as_mut()).await?;
    records_sent += 1;

    tracing::info!(
        origin = zone.origin,
        serial = zone.serial,
        records = records_sent,
        "served a full zone transfer"
    );

    Ok(ServeStats {
        serial: zone.serial,
        records: records_sent,
        status: "success",
    })
}
