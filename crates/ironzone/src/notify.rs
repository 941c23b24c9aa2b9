use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use ironzone_db::ZoneStore as _;
use ironzone_lib::{ByteBuf, DnsPacket, EncodeToBuf as _, FromBuf as _, Opcode, RecordType, ResponseCode};
use ironzone_tsig::sign_message;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;

use crate::server::{authenticate, tsig_error_response, TsigOutcome};
use crate::xfr::unix_time;
use crate::State;

/// A zone change notification accepted from the wire, handed over to the
/// scheduler for an immediate serial check
#[derive(Debug)]
pub struct Notify {
    pub origin: String,
    pub source: SocketAddr,
}

/// Handles one UDP message: a NOTIFY (RFC 1996) gets acknowledged and
/// queued for the scheduler, a SOA query gets answered so that peers can
/// probe this server's serial. Everything else is not implemented.
pub async fn handle_udp_message(
    socket: Arc<UdpSocket>,
    message: Vec<u8>,
    from: SocketAddr,
    state: Arc<State>,
    notify_tx: UnboundedSender<Notify>,
) -> anyhow::Result<()> {
    let mut reader = ByteBuf::new(&message);
    let query = match DnsPacket::from_buf(&mut reader) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::debug!(%from, "dropping a malformed UDP message: {:#}", e);
            return Ok(());
        }
    };

    if query.header.is_response {
        return Ok(());
    }

    match query.header.opcode {
        Opcode::Notify => handle_notify(&socket, &query, from, &state, &notify_tx).await,
        Opcode::Query => answer_soa_query(&socket, &message, &query, from, &state).await,
        Opcode::Unknown => {
            send_response(&socket, DnsPacket::response_to(&query, ResponseCode::NotImplemented), from).await
        }
    }
}

async fn handle_notify(
    socket: &UdpSocket,
    query: &DnsPacket<'_>,
    from: SocketAddr,
    state: &State,
    notify_tx: &UnboundedSender<Notify>,
) -> anyhow::Result<()> {
    let response_code = notify_response_code(query, state).await?;
    if response_code == ResponseCode::Success {
        let question = query.questions.first().context("bug: validated above")?;
        let event = Notify {
            origin: question.qname.to_string(),
            source: from,
        };
        tracing::info!(origin = event.origin, %from, "received a NOTIFY");
        if notify_tx.send(event).is_err() {
            tracing::warn!("scheduler is gone, a NOTIFY will not be acted upon");
        }
    }

    send_response(socket, DnsPacket::response_to(query, response_code), from).await
}

async fn notify_response_code(query: &DnsPacket<'_>, state: &State) -> anyhow::Result<ResponseCode> {
    let Some(question) = query.questions.first() else {
        return Ok(ResponseCode::FormatError);
    };
    if question.query_type != RecordType::SOA {
        return Ok(ResponseCode::FormatError);
    }
    // NOTIFYs for zones this server doesn't slave are refused
    if state.load_zone(&question.qname).await?.is_none() {
        return Ok(ResponseCode::Refused);
    }
    Ok(ResponseCode::Success)
}

/// Answers a plain SOA query, signing the response when the query was.
/// Peers use these to decide whether their copy of a zone is stale.
async fn answer_soa_query(
    socket: &UdpSocket,
    message: &[u8],
    query: &DnsPacket<'_>,
    from: SocketAddr,
    state: &State,
) -> anyhow::Result<()> {
    let Some(question) = query.questions.first() else {
        return send_response(socket, DnsPacket::response_to(query, ResponseCode::FormatError), from).await;
    };
    if question.query_type != RecordType::SOA {
        return send_response(socket, DnsPacket::response_to(query, ResponseCode::Refused), from).await;
    }

    let tsig = match authenticate(message, state).await? {
        TsigOutcome::Unsigned => None,
        TsigOutcome::Verified { key, request_mac } => Some((key, request_mac)),
        TsigOutcome::Rejected { located, error } => {
            tracing::info!(%from, "TSIG verification of a SOA query failed: {}", error);
            let response = tsig_error_response(query, located.as_ref(), &error)?;
            socket
                .send_to(&response, from)
                .await
                .context("sending a TSIG error response")?;
            return Ok(());
        }
    };

    let response = match state.load_zone(&question.qname).await? {
        Some(zone) => {
            let mut response = DnsPacket::response_to(query, ResponseCode::Success);
            response.header.answer_rr_count = 1;
            response.answers.push(zone.to_wire());
            response
        }
        None => DnsPacket::response_to(query, ResponseCode::Refused),
    };

    let mut buf = ByteBuf::new_empty(None);
    response.encode_to_buf(&mut buf).context("encoding a SOA response")?;
    if let Some((key, request_mac)) = tsig {
        sign_message(&mut buf, &key, Some(&request_mac), unix_time()?).context("signing a SOA response")?;
    }
    socket
        .send_to(&buf, from)
        .await
        .context("sending a SOA response")?;
    Ok(())
}

async fn send_response(socket: &UdpSocket, response: DnsPacket<'_>, to: SocketAddr) -> anyhow::Result<()> {
    let mut buf = ByteBuf::new_empty(None);
    response.encode_to_buf(&mut buf).context("encoding a UDP response")?;
    socket.send_to(&buf, to).await.context("sending a UDP response")?;
    Ok(())
}
