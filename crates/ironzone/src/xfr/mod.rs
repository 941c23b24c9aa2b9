mod axfr_out;
mod client;
mod ixfr_out;
mod result;

pub use axfr_out::serve_axfr;
pub use client::{check_serial, transfer_zone, try_incremental_transfer, IxfrResponse, XferClientConfig};
pub use ixfr_out::serve_ixfr;
pub use result::{XferError, XferOutcome};

use anyhow::Context as _;
use ironzone_lib::{ByteBuf, DnsPacket, EncodeToBuf as _, ResponseCode, MAX_MESSAGE_SIZE};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;

/// What an outbound transfer handler did, for the transfer log
#[derive(Debug)]
pub struct ServeStats {
    pub serial: u32,
    pub records: usize,
    pub status: &'static str,
}

impl ServeStats {
    pub(crate) fn refused() -> Self {
        ServeStats {
            serial: 0,
            records: 0,
            status: "refused",
        }
    }
}

/// Sends one DNS message behind the TCP two-byte length prefix
pub(crate) async fn send_framed(stream: &mut TcpStream, message: &[u8]) -> std::io::Result<()> {
    if message.len() > MAX_MESSAGE_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("message of {} bytes doesn't fit into a TCP frame", message.len()),
        ));
    }
    let length = (message.len() as u16).to_be_bytes();
    stream.write_all(&length).await?;
    stream.write_all(message).await?;
    Ok(())
}

/// Reads one length-prefixed DNS message
pub(crate) async fn read_framed(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let length = stream.read_u16().await? as usize;
    let mut message = vec![0; length];
    stream.read_exact(&mut message).await?;
    Ok(message)
}

/// Encodes a packet and, when a signing session is active, signs it
/// before it goes out
pub(crate) async fn send_packet(
    stream: &mut TcpStream,
    packet: &DnsPacket<'_>,
    signer: Option<&mut ironzone_tsig::SigningSession<'_>>,
) -> anyhow::Result<()> {
    let mut buf = ByteBuf::new_empty(None);
    packet.encode_to_buf(&mut buf).context("encoding a packet")?;
    if let Some(signer) = signer {
        signer.sign_next(&mut buf, unix_time()?).context("signing a packet")?;
    }
    send_framed(stream, &buf).await.context("sending a packet")
}

/// Replies with an empty response carrying only an error code
pub(crate) async fn send_error(
    stream: &mut TcpStream,
    query: &DnsPacket<'_>,
    response_code: ResponseCode,
) -> anyhow::Result<()> {
    let response = DnsPacket::response_to(query, response_code);
    send_packet(stream, &response, None).await
}

/// DNS message ID for an outgoing query
pub(crate) fn transaction_id() -> u16 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos())
        .unwrap_or_default();
    (nanos ^ std::process::id()) as u16
}

pub(crate) fn unix_time() -> anyhow::Result<u64> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .context("bug: misconfigured time on the system")
        .map(|elapsed| elapsed.as_secs())
}
