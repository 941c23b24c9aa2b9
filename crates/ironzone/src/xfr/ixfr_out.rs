use anyhow::Context as _;
use ironzone_db::{ZoneDelta, ZoneStore};
use ironzone_lib::{DnsPacket, ResourceData, ResponseCode};
use ironzone_tsig::{SigningSession, TsigKey};
use tokio::net::TcpStream;

use super::{send_packet, ServeStats};

/// How an IXFR request gets answered
#[derive(Debug, PartialEq, Eq)]
enum IxfrStyle {
    /// A single SOA: the client is current, or this store keeps no
    /// history and the client should retry with a full transfer
    SoaOnly,
    /// Deletion/addition framing between SOA markers (RFC 1995)
    Incremental,
    /// The delta would be larger than the zone itself: answer with
    /// full-zone framing instead
    FullZone,
}

/// Picks the cheaper of incremental and full-zone framing. An incremental
/// answer costs the delta plus four SOA markers, a full answer the whole
/// zone plus two.
fn choose_style(client_serial: u32, zone_serial: u32, zone_size: usize, delta: Option<&ZoneDelta>) -> IxfrStyle {
    if client_serial >= zone_serial {
        return IxfrStyle::SoaOnly;
    }
    let Some(delta) = delta else {
        return IxfrStyle::SoaOnly;
    };
    let delta_size = delta.deleted.len() + delta.added.len() + 4;
    let full_size = zone_size + 2;
    if delta_size >= full_size {
        IxfrStyle::FullZone
    } else {
        IxfrStyle::Incremental
    }
}

/// Answers an IXFR query with either a single-SOA "up to date" response,
/// an incremental diff, or a full zone, whichever applies (RFC 1995).
/// Everything fits in one message, so with TSIG a single signature covers
/// the response.
pub async fn serve_ixfr<S: ZoneStore>(
    stream: &mut TcpStream,
    query: &DnsPacket<'_>,
    tsig: Option<(&TsigKey, Vec<u8>)>,
    store: &S,
) -> anyhow::Result<ServeStats> {
    // RFC 1995 §3: the client's current SOA rides in the authority section
    let malformed = query.header.question_count != 1
        || query.header.answer_rr_count != 0
        || query.header.authority_rr_count != 1
        || !matches!(
            query.authorities.first().map(|rr| &rr.resource_data),
            Some(ResourceData::SOA { .. })
        );
    if malformed {
        super::send_error(stream, query, ResponseCode::FormatError).await?;
        return Ok(ServeStats {
            serial: 0,
            records: 0,
            status: "formerr",
        });
    }
    let question = query.questions.first().context("bug: question count was checked above")?;
    let origin = question.qname.as_ref();
    let client_serial = match query.authorities.first().map(|rr| &rr.resource_data) {
        Some(&ResourceData::SOA { serial, .. }) => serial,
        _ => anyhow::bail!("bug: authority SOA was checked above"),
    };

    let Some(zone) = store.load_zone(origin).await? else {
        super::send_error(stream, query, ResponseCode::Refused).await?;
        return Ok(ServeStats::refused());
    };
    let records = store
        .load_records(origin)
        .await
        .with_context(|| format!("loading records of zone '{}'", origin))?;
    let delta = if client_serial < zone.serial {
        store
            .changes_since(origin, client_serial)
            .await
            .with_context(|| format!("loading history of zone '{}'", origin))?
    } else {
        None
    };

    let soa_rr = zone.to_wire();
    let mut response = DnsPacket::response_to(query, ResponseCode::Success);

    match choose_style(client_serial, zone.serial, records.len(), delta.as_ref()) {
        IxfrStyle::SoaOnly => {
            response.answers.push(soa_rr);
        }
        IxfrStyle::FullZone => {
            response.answers.push(soa_rr.clone());
            response.answers.extend(records);
            response.answers.push(soa_rr);
        }
        IxfrStyle::Incremental => {
            let delta = delta.context("bug: incremental framing implies a delta")?;
            let mut old_soa = soa_rr.clone();
            if let ResourceData::SOA { serial, .. } = &mut old_soa.resource_data {
                *serial = client_serial;
            }
            response.answers.push(soa_rr.clone());
            response.answers.push(old_soa);
            response.answers.extend(delta.deleted);
            response.answers.push(soa_rr.clone());
            response.answers.extend(delta.added);
            response.answers.push(soa_rr);
        }
    }
    response.header.answer_rr_count = response.answers.len() as u16;
    let records_sent = response.answers.len();

    let mut signer = tsig.map(|(key, request_mac)| SigningSession::new(key, request_mac));
    send_packet(stream, &response, signer.as_mut()).await?;

    tracing::info!(
        origin = zone.origin,
        serial = zone.serial,
        client_serial,
        records = records_sent,
        "served an incremental zone transfer"
    );

    Ok(ServeStats {
        serial: zone.serial,
        records: records_sent,
        status: "success",
    })
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use ironzone_lib::ResourceRecord;

    use super::*;

    fn stub_delta(deleted: usize, added: usize) -> ZoneDelta {
        let rr = |name: String| ResourceRecord {
            name: Cow::Owned(name),
            class: ironzone_lib::IN_CLASS,
            ttl: 300,
            resource_data: ResourceData::A {
                address: std::net::Ipv4Addr::LOCALHOST,
            },
        };
        ZoneDelta {
            deleted: (0..deleted).map(|idx| rr(format!("del{}.example.com", idx))).collect(),
            added: (0..added).map(|idx| rr(format!("add{}.example.com", idx))).collect(),
        }
    }

    #[test]
    fn equal_serials_are_up_to_date() {
        assert_eq!(choose_style(7, 7, 100, None), IxfrStyle::SoaOnly);
        assert_eq!(choose_style(9, 7, 100, None), IxfrStyle::SoaOnly);
    }

    // Without per-record history the client has to fall back to a full
    // transfer, and a lone SOA is how it finds out
    #[test]
    fn missing_history_answers_with_a_single_soa() {
        assert_eq!(choose_style(5, 7, 100, None), IxfrStyle::SoaOnly);
    }

    #[test]
    fn small_deltas_go_out_incrementally() {
        // 10 deletions + 10 additions + 4 SOAs = 24 < 102
        let delta = stub_delta(10, 10);
        assert_eq!(choose_style(5, 7, 100, Some(&delta)), IxfrStyle::Incremental);
    }

    #[test]
    fn oversized_deltas_fall_back_to_the_full_zone() {
        // 60 deletions + 60 additions + 4 SOAs = 124 >= 102
        let delta = stub_delta(60, 60);
        assert_eq!(choose_style(5, 7, 100, Some(&delta)), IxfrStyle::FullZone);
    }
}
