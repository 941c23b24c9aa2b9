use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use ironzone_db::{TransferLog, ZoneStore as _};
use ironzone_lib::{ByteBuf, DnsPacket, EncodeToBuf as _, FromBuf as _, RecordType, ResponseCode, MAX_MESSAGE_SIZE};
use ironzone_tsig::{locate_tsig, verify_message, LocatedTsig, TsigAlgorithm, TsigError, TsigKey};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::Instrument;

use crate::notify::Notify;
use crate::xfr::{self, ServeStats};
use crate::{State, TransferAcl, MAX_TRANSFER_DURATION_SECS};

/// How long the peer gets to deliver its query after connecting
const QUERY_READ_TIMEOUT: Duration = Duration::from_secs(30);

type HandlerResult = anyhow::Result<()>;

/// Listens for zone transfer requests over TCP and NOTIFY messages over
/// UDP on the same address
pub struct XferServer {
    udp_socket: Arc<UdpSocket>,
    tcp_listener: Arc<TcpListener>,
    state: Arc<State>,
    notify_tx: tokio::sync::mpsc::UnboundedSender<Notify>,
    workers: JoinSet<HandlerResult>,
}

impl XferServer {
    pub async fn new(
        addr: SocketAddr,
        state: Arc<State>,
        notify_tx: tokio::sync::mpsc::UnboundedSender<Notify>,
    ) -> anyhow::Result<Self> {
        let tcp_listener = Arc::new(
            TcpListener::bind(addr)
                .await
                .context("error while creating a TcpListener")?,
        );
        // Share the port the listener got, which matters when 0 was asked for
        let udp_addr = tcp_listener.local_addr().context("TcpListener has no local addr")?;
        let udp_socket = Arc::new(
            UdpSocket::bind(udp_addr)
                .await
                .context("error while creating a UDP socket")?,
        );

        Ok(XferServer {
            udp_socket,
            tcp_listener,
            state,
            notify_tx,
            workers: JoinSet::new(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp_listener.local_addr().context("TcpListener has no local addr")
    }

    pub async fn add_workers(&mut self, n: usize) {
        for idx in 0..n {
            let udp_socket = self.udp_socket.clone();
            let tcp_listener = self.tcp_listener.clone();
            let state = self.state.clone();
            let notify_tx = self.notify_tx.clone();

            self.workers.spawn(
                handle_incoming_requests(udp_socket, tcp_listener, state, notify_tx)
                    .instrument(tracing::trace_span!("", worker = idx)),
            );
        }
    }

    pub async fn block_until_completion(&mut self) -> anyhow::Result<()> {
        loop {
            if let Some(result) = self.workers.join_next().await {
                if let Err(e) = result.context("worker task failed to execute")? {
                    tracing::debug!("Error in a worker: {}", e);
                }
            } else {
                // No workers left
                break;
            }
        }

        Ok(())
    }
}

async fn handle_incoming_requests(
    udp_socket: Arc<UdpSocket>,
    tcp_listener: Arc<TcpListener>,
    state: Arc<State>,
    notify_tx: tokio::sync::mpsc::UnboundedSender<Notify>,
) -> HandlerResult {
    let mut recv = vec![0; MAX_MESSAGE_SIZE];
    let mut handlers: JoinSet<HandlerResult> = JoinSet::new();
    loop {
        tokio::select! {
            Ok((n, from)) = udp_socket.recv_from(&mut recv) => {
                tracing::trace!(%from, "new UDP message");

                let message = recv[..n].to_vec();
                handlers.spawn(
                    crate::notify::handle_udp_message(udp_socket.clone(), message, from, state.clone(), notify_tx.clone())
                        .in_current_span(),
                );
            }
            Ok((stream, from)) = tcp_listener.accept() => {
                tracing::trace!(%from, "new TCP connection");

                handlers.spawn(handle_transfer_request(stream, from, state.clone()).in_current_span());
            }
            Some(result) = handlers.join_next() => {
               result
                   .context("connection handling task failed to execute")?
                   .context("unrecoverable error while handling a request")?;
            }
        };
    }
}

/// Reads a single query off the connection and serves the transfer it
/// asks for. Dispatch order is parse, query type, ACL, TSIG: a signed
/// query from a disallowed address is refused without touching the key
/// table.
async fn handle_transfer_request(mut stream: TcpStream, from: SocketAddr, state: Arc<State>) -> HandlerResult {
    let message = match timeout(QUERY_READ_TIMEOUT, xfr::read_framed(&mut stream)).await {
        Ok(Ok(message)) => message,
        Ok(Err(e)) => {
            tracing::debug!(%from, "failed to read a query: {}", e);
            return Ok(());
        }
        Err(_) => {
            tracing::debug!(%from, "peer didn't deliver a query in time");
            return Ok(());
        }
    };

    let mut reader = ByteBuf::new(&message);
    let query = match DnsPacket::from_buf(&mut reader) {
        Ok(query) => query,
        Err(e) => {
            tracing::debug!(%from, "dropping a malformed query: {:#}", e);
            return Ok(());
        }
    };

    let Some(question) = query.questions.first() else {
        return xfr::send_error(&mut stream, &query, ResponseCode::FormatError).await;
    };
    let kind = match question.query_type {
        RecordType::AXFR => "axfr-out",
        RecordType::IXFR => "ixfr-out",
        _ => {
            tracing::debug!(%from, query_type = ?question.query_type, "refusing a non-transfer query over TCP");
            return xfr::send_error(&mut stream, &query, ResponseCode::NotImplemented).await;
        }
    };
    let origin = question.qname.to_string();

    // Zones can carry their own ACL in the `xfer` column, which overrides
    // the global one for that zone only
    let zone_acl = match state.db.load_zone(&origin).await? {
        Some(zone) => zone.xfer.as_deref().map(parse_zone_acl),
        None => None,
    };
    let allowed = match &zone_acl {
        Some(acl) => acl.is_allowed(from.ip()),
        None => state.acl.is_allowed(from.ip()),
    };
    if !allowed {
        tracing::info!(%from, origin, "transfer refused by the ACL");
        state.record_transfer(TransferLog::new(&origin, kind, Some(from.ip()), 0, 0, 0, "refused")?);
        return xfr::send_error(&mut stream, &query, ResponseCode::Refused).await;
    }

    let tsig = match authenticate(&message, &state).await? {
        TsigOutcome::Unsigned if state.require_tsig => {
            tracing::info!(%from, origin, "refusing an unsigned query, TSIG is required");
            state.record_transfer(TransferLog::new(&origin, kind, Some(from.ip()), 0, 0, 0, "refused")?);
            return xfr::send_error(&mut stream, &query, ResponseCode::Refused).await;
        }
        TsigOutcome::Unsigned => None,
        TsigOutcome::Verified { key, request_mac } => Some((key, request_mac)),
        TsigOutcome::Rejected { located, error } => {
            tracing::info!(%from, origin, "TSIG verification failed: {}", error);
            state.record_transfer(TransferLog::new(&origin, kind, Some(from.ip()), 0, 0, 0, "tsig-error")?);
            return send_tsig_error(&mut stream, &query, located.as_ref(), &error).await;
        }
    };

    let started = Instant::now();
    let serve = async {
        let tsig = tsig.as_ref().map(|(key, mac)| (key, mac.clone()));
        match question.query_type {
            RecordType::AXFR => xfr::serve_axfr(&mut stream, &query, tsig, state.as_ref()).await,
            _ => xfr::serve_ixfr(&mut stream, &query, tsig, state.as_ref()).await,
        }
    };
    let stats = match timeout(Duration::from_secs(MAX_TRANSFER_DURATION_SECS), serve).await {
        Ok(Ok(stats)) => stats,
        Ok(Err(e)) => {
            tracing::warn!(%from, origin, "transfer failed: {:#}", e);
            ServeStats {
                serial: 0,
                records: 0,
                status: "error",
            }
        }
        Err(_) => {
            tracing::warn!(%from, origin, "transfer ran into the duration limit");
            ServeStats {
                serial: 0,
                records: 0,
                status: "timeout",
            }
        }
    };

    state.record_transfer(TransferLog::new(
        &origin,
        kind,
        Some(from.ip()),
        stats.serial,
        stats.records as u32,
        started.elapsed().as_millis() as u32,
        stats.status,
    )?);

    Ok(())
}

/// A zone's `xfer` column holds comma-separated ACL rules. Rules that
/// don't parse deny every peer rather than falling back to the global ACL.
fn parse_zone_acl(rules: &str) -> TransferAcl {
    let rules: Vec<String> = rules
        .split(',')
        .map(|rule| rule.trim().to_owned())
        .filter(|rule| !rule.is_empty())
        .collect();
    match TransferAcl::parse(&rules) {
        Ok(acl) => acl,
        Err(e) => {
            tracing::warn!("denying transfers over an unusable per-zone ACL: {:#}", e);
            TransferAcl::default()
        }
    }
}

pub(crate) enum TsigOutcome {
    Unsigned,
    Verified { key: TsigKey, request_mac: Vec<u8> },
    Rejected { located: Option<LocatedTsig>, error: TsigError },
}

/// Resolves the query's TSIG RR against the key table and verifies the
/// request MAC
pub(crate) async fn authenticate(message: &[u8], state: &State) -> anyhow::Result<TsigOutcome> {
    let located = match locate_tsig(message) {
        Ok(located) => located,
        Err(TsigError::NotSigned) => return Ok(TsigOutcome::Unsigned),
        Err(error) => {
            return Ok(TsigOutcome::Rejected { located: None, error });
        }
    };

    let key = match state.db.load_tsig_key(&located.key_name).await? {
        Some(row) => {
            let algorithm = TsigAlgorithm::from_name(&row.algorithm)
                .with_context(|| format!("key '{}' uses an unknown algorithm '{}'", row.name, row.algorithm))?;
            TsigKey::new(&row.name, algorithm, &row.secret)?
        }
        None => {
            let error = TsigError::BadKey(located.key_name.clone());
            return Ok(TsigOutcome::Rejected {
                located: Some(located),
                error,
            });
        }
    };

    match verify_message(message, &key, None, xfr::unix_time()?) {
        Ok(tsig) => Ok(TsigOutcome::Verified {
            key,
            request_mac: tsig.mac,
        }),
        Err(error) => Ok(TsigOutcome::Rejected {
            located: Some(located),
            error,
        }),
    }
}

/// Builds a NOTAUTH response to a failed TSIG check, carrying an
/// unsigned TSIG RR with the extended error code (RFC 2845 §4.5.3)
pub(crate) fn tsig_error_response(
    query: &DnsPacket<'_>,
    located: Option<&LocatedTsig>,
    error: &TsigError,
) -> anyhow::Result<ByteBuf<'static>> {
    let mut response = DnsPacket::response_to(query, ResponseCode::NotAuth);
    if let Some(located) = located {
        let now = xfr::unix_time()?;
        // On BadTime the server reports its own clock in the other data
        let other_data = if matches!(error, TsigError::BadTime) {
            (now & 0xFFFF_FFFF_FFFF).to_be_bytes()[2..].to_vec()
        } else {
            Vec::new()
        };
        response.additionals.push(ironzone_lib::ResourceRecord {
            name: located.key_name.clone().into(),
            class: ironzone_lib::ANY_CLASS,
            ttl: 0,
            resource_data: ironzone_lib::ResourceData::TSIG {
                algorithm_name: located.algorithm_name.clone().into(),
                time_signed: located.time_signed,
                fudge: located.fudge,
                mac: Vec::new().into(),
                original_id: located.original_id,
                error: error.extended_rcode(),
                other_data: other_data.into(),
            },
        });
        response.header.additional_rr_count = 1;
    }

    let mut buf = ByteBuf::new_empty(None);
    response
        .encode_to_buf(&mut buf)
        .context("encoding a TSIG error response")?;
    Ok(buf)
}

async fn send_tsig_error(
    stream: &mut TcpStream,
    query: &DnsPacket<'_>,
    located: Option<&LocatedTsig>,
    error: &TsigError,
) -> anyhow::Result<()> {
    let response = tsig_error_response(query, located, error)?;
    xfr::send_framed(stream, &response)
        .await
        .context("sending a TSIG error response")
}

#[cfg(test)]
mod tests {
    use ironzone_db::{MemoryStore, Model as _, SqliteStore, TsigKeyRow, ZoneStore as _};
    use ironzone_lib::{EncodeToBuf as _, Opcode, Question, ResourceData, ResourceRecord};
    use ironzone_tsig::TsigAlgorithm;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    use super::*;
    use crate::notify::Notify;
    use crate::xfr::{
        check_serial, transfer_zone, try_incremental_transfer, IxfrResponse, XferClientConfig, XferError,
    };
    use crate::TransferAcl;

    const KEY_NAME: &str = "transfer-key";
    const SECRET: &str = "c2hhcmVkLXNlY3JldA==";

    fn soa_rr(serial: u32) -> ResourceRecord<'static> {
        ResourceRecord::new(
            "example.com",
            ResourceData::SOA {
                mname: "ns1.example.com".into(),
                rname: "hostmaster.example.com".into(),
                serial,
                refresh: 7200,
                retry: 1800,
                expire: 1209600,
                minimum: 300,
            },
            Some(300),
            None,
        )
        .into_owned()
    }

    fn a_rr(name: &str) -> ResourceRecord<'static> {
        ResourceRecord::new(
            name,
            ResourceData::A {
                address: "192.0.2.10".parse().unwrap(),
            },
            Some(300),
            None,
        )
        .into_owned()
    }

    /// Spins a server up on a loopback port with a zone that went through
    /// two generations: serial 1 had `ftp`, serial 5 replaced it with
    /// `mail`, and eight stable `a{n}` records survived both
    async fn start_server(
        acl: TransferAcl,
    ) -> (
        SocketAddr,
        Arc<State>,
        UnboundedReceiver<Notify>,
        UnboundedReceiver<TransferLog>,
    ) {
        start_server_with(acl, false).await
    }

    async fn start_server_with(
        acl: TransferAcl,
        require_tsig: bool,
    ) -> (
        SocketAddr,
        Arc<State>,
        UnboundedReceiver<Notify>,
        UnboundedReceiver<TransferLog>,
    ) {
        let db = SqliteStore::open_in_memory().await.unwrap();

        let mut stable: Vec<ResourceRecord<'static>> =
            (0..8).map(|idx| a_rr(&format!("a{}.example.com", idx))).collect();
        let mut generation_1 = stable.clone();
        generation_1.push(a_rr("ftp.example.com"));
        db.replace_zone(&soa_rr(1), &generation_1).await.unwrap();
        stable.push(a_rr("mail.example.com"));
        db.replace_zone(&soa_rr(5), &stable).await.unwrap();

        let mut connection = db.get_connection().await.unwrap();
        TsigKeyRow {
            id: 0,
            name: KEY_NAME.to_owned(),
            algorithm: "hmac-sha256".to_owned(),
            secret: SECRET.to_owned(),
        }
        .insert_into(&mut connection)
        .await
        .unwrap();
        drop(connection);

        let (log_tx, log_rx) = unbounded_channel();
        let state = Arc::new(State {
            db,
            cache: MemoryStore::new(),
            acl,
            require_tsig,
            log_tx,
            max_inbound_transfer_size: crate::DEFAULT_MAX_INBOUND_TRANSFER_SIZE,
        });

        let (notify_tx, notify_rx) = unbounded_channel();
        let mut server = XferServer::new("127.0.0.1:0".parse().unwrap(), state.clone(), notify_tx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        server.add_workers(2).await;
        tokio::spawn(async move { server.block_until_completion().await });

        (addr, state, notify_rx, log_rx)
    }

    #[tokio::test]
    async fn full_zone_transfer_end_to_end() {
        let (addr, _state, _notify_rx, mut log_rx) = start_server(TransferAcl::allow_all()).await;

        let target = MemoryStore::new();
        let outcome = transfer_zone("example.com", &addr.to_string(), &XferClientConfig::default(), &target)
            .await
            .unwrap();

        assert_eq!(outcome.new_serial, 5);
        // 9 records between two copies of the SOA
        assert_eq!(outcome.records_received, 11);
        assert_eq!(outcome.records_added, 9);
        assert_eq!(outcome.records_updated, 0);
        assert_eq!(outcome.records_deleted, 0);

        let zone = target.load_zone("example.com").await.unwrap().unwrap();
        assert_eq!(zone.serial, 5);
        assert_eq!(target.load_records("example.com").await.unwrap().len(), 9);

        let log = log_rx.recv().await.unwrap();
        assert_eq!(log.kind, "axfr-out");
        assert_eq!(log.status, "success");
        assert_eq!(log.serial, 5);
    }

    #[tokio::test]
    async fn signed_transfers_verify_the_mac_chain() {
        let (addr, _state, _notify_rx, _log_rx) = start_server(TransferAcl::allow_all()).await;

        let config = XferClientConfig {
            tsig_key: Some(TsigKey::new(KEY_NAME, TsigAlgorithm::HmacSha256, SECRET).unwrap()),
            ..XferClientConfig::default()
        };
        let target = MemoryStore::new();
        let outcome = transfer_zone("example.com", &addr.to_string(), &config, &target)
            .await
            .unwrap();
        assert_eq!(outcome.new_serial, 5);

        // A key the server doesn't know gets a NOTAUTH with an unsigned
        // TSIG RR, which never passes client-side verification
        let config = XferClientConfig {
            tsig_key: Some(TsigKey::new("unknown-key", TsigAlgorithm::HmacSha256, SECRET).unwrap()),
            ..XferClientConfig::default()
        };
        let err = transfer_zone("example.com", &addr.to_string(), &config, &target)
            .await
            .unwrap_err();
        assert!(matches!(err, XferError::Tsig(_)), "unexpected error: {err}");

        // Same for a known key with the wrong secret
        let config = XferClientConfig {
            tsig_key: Some(TsigKey::new(KEY_NAME, TsigAlgorithm::HmacSha256, "d3Jvbmctc2VjcmV0").unwrap()),
            ..XferClientConfig::default()
        };
        let err = transfer_zone("example.com", &addr.to_string(), &config, &target)
            .await
            .unwrap_err();
        assert!(matches!(err, XferError::Tsig(_)), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn transfers_not_matching_the_acl_are_refused() {
        let (addr, _state, _notify_rx, mut log_rx) = start_server(TransferAcl::parse(&[]).unwrap()).await;

        let target = MemoryStore::new();
        let err = transfer_zone("example.com", &addr.to_string(), &XferClientConfig::default(), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, XferError::Refused(ResponseCode::Refused)), "unexpected error: {err}");

        let log = log_rx.recv().await.unwrap();
        assert_eq!(log.status, "refused");
    }

    #[tokio::test]
    async fn unknown_zones_are_refused() {
        let (addr, _state, _notify_rx, _log_rx) = start_server(TransferAcl::allow_all()).await;

        let target = MemoryStore::new();
        let err = transfer_zone("other.org", &addr.to_string(), &XferClientConfig::default(), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, XferError::Refused(ResponseCode::Refused)), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn unsigned_queries_are_refused_when_tsig_is_required() {
        let (addr, _state, _notify_rx, mut log_rx) = start_server_with(TransferAcl::allow_all(), true).await;

        let target = MemoryStore::new();
        let err = transfer_zone("example.com", &addr.to_string(), &XferClientConfig::default(), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, XferError::Refused(ResponseCode::Refused)), "unexpected error: {err}");
        let log = log_rx.recv().await.unwrap();
        assert_eq!(log.status, "refused");

        // Signed queries still go through
        let config = XferClientConfig {
            tsig_key: Some(TsigKey::new(KEY_NAME, TsigAlgorithm::HmacSha256, SECRET).unwrap()),
            ..XferClientConfig::default()
        };
        let outcome = transfer_zone("example.com", &addr.to_string(), &config, &target)
            .await
            .unwrap();
        assert_eq!(outcome.new_serial, 5);
    }

    #[tokio::test]
    async fn per_zone_acl_overrides_the_global_one() {
        let (addr, state, _notify_rx, _log_rx) = start_server(TransferAcl::allow_all()).await;
        state.db.set_zone_xfer("example.com", Some("192.0.2.0/24")).await.unwrap();

        let target = MemoryStore::new();
        let err = transfer_zone("example.com", &addr.to_string(), &XferClientConfig::default(), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, XferError::Refused(ResponseCode::Refused)), "unexpected error: {err}");

        state.db.set_zone_xfer("example.com", Some("127.0.0.1, ::1")).await.unwrap();
        let outcome = transfer_zone("example.com", &addr.to_string(), &XferClientConfig::default(), &target)
            .await
            .unwrap();
        assert_eq!(outcome.new_serial, 5);
    }

    async fn exchange_ixfr(addr: SocketAddr, client_serial: u32) -> DnsPacket<'static> {
        let mut query = DnsPacket::new();
        query.header.id = 4242;
        query.header.question_count = 1;
        query.questions.push(Question::new("example.com", RecordType::IXFR, None));
        query.header.authority_rr_count = 1;
        query.authorities.push(soa_rr(client_serial));

        let mut buf = ByteBuf::new_empty(None);
        query.encode_to_buf(&mut buf).unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        xfr::send_framed(&mut stream, &buf).await.unwrap();
        let response = xfr::read_framed(&mut stream).await.unwrap();

        let mut reader = ByteBuf::new(&response);
        DnsPacket::from_buf(&mut reader).unwrap()
    }

    #[tokio::test]
    async fn incremental_transfers_use_rfc_1995_framing() {
        let (addr, _state, _notify_rx, mut log_rx) = start_server(TransferAcl::allow_all()).await;

        let response = exchange_ixfr(addr, 1).await;
        assert_eq!(response.header.id, 4242);
        assert_eq!(response.header.response_code, ResponseCode::Success);

        // SOA(5), SOA(1), deleted ftp, SOA(5), added mail, SOA(5)
        let serials: Vec<Option<u32>> = response
            .answers
            .iter()
            .map(|rr| match rr.resource_data {
                ResourceData::SOA { serial, .. } => Some(serial),
                _ => None,
            })
            .collect();
        assert_eq!(serials, vec![Some(5), Some(1), None, Some(5), None, Some(5)]);
        assert_eq!(response.answers[2].name, "ftp.example.com");
        assert_eq!(response.answers[4].name, "mail.example.com");

        let log = log_rx.recv().await.unwrap();
        assert_eq!(log.kind, "ixfr-out");
        assert_eq!(log.status, "success");
    }

    #[tokio::test]
    async fn incremental_client_applies_the_delta() {
        let (addr, _state, _notify_rx, _log_rx) = start_server(TransferAcl::allow_all()).await;

        // A slave that still holds generation 1 of the zone
        let target = MemoryStore::new();
        let mut old_records: Vec<ResourceRecord<'static>> =
            (0..8).map(|idx| a_rr(&format!("a{}.example.com", idx))).collect();
        old_records.push(a_rr("ftp.example.com"));
        target.replace_zone(&soa_rr(1), &old_records).await.unwrap();

        let local_soa = target.load_zone("example.com").await.unwrap().unwrap().to_wire();
        let response = try_incremental_transfer(
            "example.com",
            &addr.to_string(),
            &local_soa,
            &XferClientConfig::default(),
            &target,
        )
        .await
        .unwrap();
        let outcome = match response {
            IxfrResponse::Applied(outcome) => outcome,
            other => panic!("unexpected response: {other:?}"),
        };
        assert_eq!(outcome.new_serial, 5);
        assert_eq!(outcome.records_added, 1);
        assert_eq!(outcome.records_updated, 0);
        assert_eq!(outcome.records_deleted, 1);

        let zone = target.load_zone("example.com").await.unwrap().unwrap();
        assert_eq!(zone.serial, 5);
        let names: Vec<_> = target
            .load_records("example.com")
            .await
            .unwrap()
            .into_iter()
            .map(|rr| rr.name.into_owned())
            .collect();
        assert_eq!(names.len(), 9);
        assert!(names.contains(&"mail.example.com".to_owned()));
        assert!(!names.contains(&"ftp.example.com".to_owned()));

        // A second attempt finds the zone current
        let local_soa = zone.to_wire();
        let response = try_incremental_transfer(
            "example.com",
            &addr.to_string(),
            &local_soa,
            &XferClientConfig::default(),
            &target,
        )
        .await
        .unwrap();
        assert!(matches!(response, IxfrResponse::UpToDate));
    }

    // Too much history makes the delta bigger than the zone, so the reply
    // carries the full zone in the RFC 1995 single-message form
    #[tokio::test]
    async fn oversized_deltas_serve_the_full_zone_in_one_message() {
        let (addr, _state, _notify_rx, _log_rx) = start_server(TransferAcl::allow_all()).await;

        let target = MemoryStore::new();
        let response = try_incremental_transfer(
            "example.com",
            &addr.to_string(),
            &soa_rr(0),
            &XferClientConfig::default(),
            &target,
        )
        .await
        .unwrap();
        assert!(matches!(response, IxfrResponse::Applied(_)), "unexpected response: {response:?}");

        let zone = target.load_zone("example.com").await.unwrap().unwrap();
        assert_eq!(zone.serial, 5);
        assert_eq!(target.load_records("example.com").await.unwrap().len(), 9);
    }

    // RFC 1995 queries carry the client's SOA in the authority section
    #[tokio::test]
    async fn ixfr_queries_without_an_authority_soa_get_formerr() {
        let (addr, _state, _notify_rx, mut log_rx) = start_server(TransferAcl::allow_all()).await;

        let mut query = DnsPacket::new();
        query.header.id = 7;
        query.header.question_count = 1;
        query.questions.push(Question::new("example.com", RecordType::IXFR, None));
        let mut buf = ByteBuf::new_empty(None);
        query.encode_to_buf(&mut buf).unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        xfr::send_framed(&mut stream, &buf).await.unwrap();
        let response = xfr::read_framed(&mut stream).await.unwrap();

        let mut reader = ByteBuf::new(&response);
        let response = DnsPacket::from_buf(&mut reader).unwrap();
        assert_eq!(response.header.id, 7);
        assert_eq!(response.header.response_code, ResponseCode::FormatError);

        let log = log_rx.recv().await.unwrap();
        assert_eq!(log.status, "formerr");

        // Same for a query smuggling records into the answer section
        let mut query = DnsPacket::new();
        query.header.id = 8;
        query.header.question_count = 1;
        query.questions.push(Question::new("example.com", RecordType::IXFR, None));
        query.header.answer_rr_count = 1;
        query.answers.push(a_rr("www.example.com"));
        query.header.authority_rr_count = 1;
        query.authorities.push(soa_rr(1));
        let mut buf = ByteBuf::new_empty(None);
        query.encode_to_buf(&mut buf).unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        xfr::send_framed(&mut stream, &buf).await.unwrap();
        let response = xfr::read_framed(&mut stream).await.unwrap();

        let mut reader = ByteBuf::new(&response);
        let response = DnsPacket::from_buf(&mut reader).unwrap();
        assert_eq!(response.header.response_code, ResponseCode::FormatError);
    }

    #[tokio::test]
    async fn current_clients_get_a_single_soa() {
        let (addr, _state, _notify_rx, _log_rx) = start_server(TransferAcl::allow_all()).await;

        let response = exchange_ixfr(addr, 5).await;
        assert_eq!(response.answers.len(), 1);
        assert!(matches!(
            response.answers[0].resource_data,
            ResourceData::SOA { serial: 5, .. }
        ));
    }

    #[tokio::test]
    async fn soa_probes_and_notify_work_over_udp() {
        let (addr, _state, mut notify_rx, _log_rx) = start_server(TransferAcl::allow_all()).await;

        let serial = check_serial("example.com", &addr.to_string(), &XferClientConfig::default())
            .await
            .unwrap();
        assert_eq!(serial, Some(5));

        // Signed probes get signed answers
        let config = XferClientConfig {
            tsig_key: Some(TsigKey::new(KEY_NAME, TsigAlgorithm::HmacSha256, SECRET).unwrap()),
            ..XferClientConfig::default()
        };
        let serial = check_serial("example.com", &addr.to_string(), &config).await.unwrap();
        assert_eq!(serial, Some(5));

        let mut notify = DnsPacket::new();
        notify.header.id = 99;
        notify.header.opcode = Opcode::Notify;
        notify.header.question_count = 1;
        notify.questions.push(Question::new("example.com", RecordType::SOA, None));
        let mut buf = ByteBuf::new_empty(None);
        notify.encode_to_buf(&mut buf).unwrap();

        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(&buf, addr).await.unwrap();
        let mut response = vec![0; 512];
        let received = socket.recv(&mut response).await.unwrap();
        response.truncate(received);

        let mut reader = ByteBuf::new(&response);
        let response = DnsPacket::from_buf(&mut reader).unwrap();
        assert_eq!(response.header.id, 99);
        assert_eq!(response.header.opcode, Opcode::Notify);
        assert_eq!(response.header.response_code, ResponseCode::Success);

        let event = notify_rx.recv().await.unwrap();
        assert_eq!(event.origin, "example.com");
    }
}
