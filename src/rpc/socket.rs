//! UDP socket layer managing incoming/outgoing requests and responses.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, trace};

use crate::common::{ErrorSpecific, Message, MessageType, RequestSpecific, ResponseSpecific};

use super::config::Config;

const VERSION: [u8; 4] = [77, 83, 0, 1]; // "MS" version 01
const MTU: usize = 2048;

pub const DEFAULT_PORT: u16 = 6881;
/// Default request timeout before abandoning an inflight request to a
/// non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// A UdpSocket wrapper that formats and correlates DHT requests and responses.
#[derive(Debug)]
pub struct KrpcSocket {
    socket: UdpSocket,
    pub(crate) read_only: bool,
    request_timeout: Duration,
    inflight_requests: HashMap<u32, InflightRequest>,

    local_addr: SocketAddrV4,
}

#[derive(Debug)]
struct InflightRequest {
    to: SocketAddrV4,
    sent_at: Instant,
}

impl KrpcSocket {
    pub(crate) fn new(config: &Config) -> Result<Self, std::io::Error> {
        let host = config.host.unwrap_or(Ipv4Addr::UNSPECIFIED);

        let socket = if let Some(port) = config.port {
            UdpSocket::bind(SocketAddrV4::new(host, port))?
        } else {
            match UdpSocket::bind(SocketAddrV4::new(host, DEFAULT_PORT)) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddrV4::new(host, 0)),
            }?
        };

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unimplemented!("KrpcSocket does not support IPv6"),
        };

        socket.set_nonblocking(true)?;

        Ok(Self {
            socket,
            read_only: config.read_only,
            request_timeout: config.request_timeout,
            inflight_requests: HashMap::new(),

            local_addr,
        })
    }

    // === Getters ===

    /// Returns the address the socket is listening on.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    // === Public Methods ===

    /// Returns true if this transaction_id is still inflight.
    pub fn inflight(&self, transaction_id: &u32) -> bool {
        self.inflight_requests.contains_key(transaction_id)
    }

    /// Stop expecting a response for this transaction_id.
    pub fn cancel(&mut self, transaction_id: &u32) {
        self.inflight_requests.remove(transaction_id);
    }

    /// Send a request to the given address and return the transaction_id.
    pub fn request(&mut self, address: SocketAddrV4, request: RequestSpecific) -> u32 {
        let transaction_id = self.tid();
        let message = self.request_message(transaction_id, request);
        trace!(context = "socket_message_sending", ?message);

        self.inflight_requests.insert(
            transaction_id,
            InflightRequest {
                to: address,
                sent_at: Instant::now(),
            },
        );

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending request message");
        });

        transaction_id
    }

    /// Send a response to the given address.
    pub fn response(
        &mut self,
        address: SocketAddrV4,
        transaction_id: &[u8],
        response: ResponseSpecific,
    ) {
        let message =
            self.response_message(MessageType::Response(response), address, transaction_id);
        trace!(context = "socket_message_sending", ?message);

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending response message");
        });
    }

    /// Send an error to the given address.
    pub fn error(&mut self, address: SocketAddrV4, transaction_id: &[u8], error: ErrorSpecific) {
        let message = self.response_message(MessageType::Error(error), address, transaction_id);

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending error message");
        });
    }

    /// Remove and return inflight requests that have outlived the request
    /// timeout without a response.
    pub fn timeouts(&mut self) -> Vec<(u32, SocketAddrV4)> {
        // A zero timeout disables expiry altogether.
        if self.request_timeout.is_zero() {
            return Vec::new();
        }

        let timeout = self.request_timeout;
        let expired: Vec<u32> = self
            .inflight_requests
            .iter()
            .filter(|(_, request)| request.sent_at.elapsed() > timeout)
            .map(|(tid, _)| *tid)
            .collect();

        expired
            .into_iter()
            .map(|tid| {
                let request = self
                    .inflight_requests
                    .remove(&tid)
                    .expect("expired tid collected above");
                (tid, request.to)
            })
            .collect()
    }

    /// Receives a single KRPC message on the socket.
    /// On success, returns the message and its origin.
    pub fn recv_from(&mut self) -> Option<(Message, SocketAddrV4)> {
        let mut buf = [0_u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(
                        context = "socket_validation",
                        message = "Response from port 0"
                    );
                    return None;
                }

                match Message::from_bytes(bytes) {
                    Ok(message) => {
                        let expected = match message.message_type {
                            MessageType::Request(_) => {
                                // Requests never consult the inflight table.
                                true
                            }
                            MessageType::Response(_) | MessageType::Error(_) => {
                                self.is_expected_response(&message, &from)
                            }
                        };

                        if expected {
                            trace!(context = "socket_message_receiving", ?message, ?from);
                            return Some((message, from));
                        }
                    }
                    Err(error) => {
                        debug!(
                            context = "socket_error",
                            ?error,
                            ?from,
                            message = ?String::from_utf8_lossy(bytes),
                            "Received invalid bencode message"
                        );
                    }
                }
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!(
                    context = "socket_validation",
                    message = "Received IPv6 packet"
                );
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_micros(100)); // yield for a bit
            }
            Err(e) => {
                debug!(context = "socket_error", ?e, "recv_from failed unexpectedly");
            }
        }

        None
    }

    // === Private Methods ===

    fn is_expected_response(&mut self, message: &Message, from: &SocketAddrV4) -> bool {
        let Some(transaction_id) = parse_tid(&message.transaction_id) else {
            trace!(
                context = "socket_validation",
                message = "Response with a foreign transaction id length"
            );
            return false;
        };

        match self.inflight_requests.get(&transaction_id) {
            Some(request) if compare_socket_addr(&request.to, from) => {
                self.inflight_requests.remove(&transaction_id);
                true
            }
            Some(_) => {
                trace!(
                    context = "socket_validation",
                    message = "Response from wrong address"
                );
                false
            }
            None => {
                debug!(
                    context = "socket_validation",
                    transaction_id,
                    ?from,
                    "Unexpected response transaction id"
                );
                false
            }
        }
    }

    /// Four random bytes, resampled until they don't collide with an
    /// outstanding request.
    fn tid(&mut self) -> u32 {
        let mut rng = rand::thread_rng();

        loop {
            let tid: u32 = rng.gen();
            if !self.inflight_requests.contains_key(&tid) {
                return tid;
            }
        }
    }

    fn request_message(&mut self, transaction_id: u32, request: RequestSpecific) -> Message {
        Message {
            transaction_id: transaction_id.to_be_bytes().into(),
            message_type: MessageType::Request(request),
            version: Some(VERSION),
            read_only: self.read_only,
            requester_ip: None,
        }
    }

    /// Same as request_message but echoing the request's transaction_id and
    /// reporting the requester's address (BEP_0042).
    fn response_message(
        &mut self,
        message: MessageType,
        requester_ip: SocketAddrV4,
        request_tid: &[u8],
    ) -> Message {
        Message {
            transaction_id: request_tid.into(),
            message_type: message,
            version: Some(VERSION),
            read_only: self.read_only,
            requester_ip: Some(requester_ip),
        }
    }

    /// Send a raw DHT message.
    fn send(&mut self, address: SocketAddrV4, message: Message) -> Result<(), SendMessageError> {
        self.socket.send_to(&message.to_bytes()?, address)?;
        Ok(())
    }
}

pub(crate) fn parse_tid(bytes: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = bytes.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

#[derive(thiserror::Error, Debug)]
pub enum SendMessageError {
    #[error("Failed to encode packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

// Same as SocketAddrV4::eq but ignores the ip if it is unspecified for testing reasons.
fn compare_socket_addr(a: &SocketAddrV4, b: &SocketAddrV4) -> bool {
    if a.port() != b.port() {
        return false;
    }

    if a.ip().is_unspecified() {
        return true;
    }

    a.ip() == b.ip()
}

#[cfg(test)]
mod test {
    use std::thread;

    use crate::common::{Id, PingResponseArguments, RequestTypeSpecific};

    use super::*;

    fn test_socket() -> KrpcSocket {
        KrpcSocket::new(&Config {
            host: Some([127, 0, 0, 1].into()),
            port: Some(0),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn tids_are_unique_among_inflight() {
        let mut socket = test_socket();
        let address = socket.local_addr();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let tid = socket.request(
                address,
                RequestSpecific {
                    requester_id: Id::random(),
                    request_type: RequestTypeSpecific::Ping,
                },
            );
            assert!(seen.insert(tid));
            assert!(socket.inflight(&tid));
        }
    }

    #[test]
    fn recv_request() {
        let mut server = test_socket();
        let server_address = server.local_addr();

        let mut client = test_socket();
        let client_address = client.local_addr();

        let request = RequestSpecific {
            requester_id: Id::random(),
            request_type: RequestTypeSpecific::Ping,
        };
        let expected_request = request.clone();

        let server_thread = thread::spawn(move || loop {
            if let Some((message, from)) = server.recv_from() {
                assert_eq!(from.port(), client_address.port());
                assert_eq!(message.version, Some(VERSION));
                assert_eq!(message.message_type, MessageType::Request(expected_request));
                break;
            }
        });

        client.request(server_address, request);

        server_thread.join().unwrap();
    }

    #[test]
    fn response_resolves_inflight_request() {
        let (tx, rx) = flume::bounded(1);

        let mut client = test_socket();
        let client_address = client.local_addr();

        let responder_id = Id::random();
        let response = ResponseSpecific::Ping(PingResponseArguments { responder_id });

        let server_thread = thread::spawn(move || {
            let mut server = test_socket();
            tx.send(server.local_addr()).unwrap();

            loop {
                server.inflight_requests.insert(
                    8,
                    InflightRequest {
                        to: client_address,
                        sent_at: Instant::now(),
                    },
                );

                if let Some((message, from)) = server.recv_from() {
                    assert_eq!(from.port(), client_address.port());
                    assert_eq!(message.transaction_id.as_ref(), &8_u32.to_be_bytes()[..]);
                    assert_eq!(
                        message.message_type,
                        MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                            responder_id,
                        }))
                    );
                    assert!(!server.inflight(&8));
                    break;
                }
            }
        });

        let server_address = rx.recv().unwrap();

        client.response(server_address, &8_u32.to_be_bytes(), response);

        server_thread.join().unwrap();
    }

    #[test]
    fn ignore_response_from_wrong_address() {
        let mut server = test_socket();
        let server_address = server.local_addr();

        let mut client = test_socket();
        let client_address = client.local_addr();

        server.inflight_requests.insert(
            8,
            InflightRequest {
                to: SocketAddrV4::new([127, 0, 0, 1].into(), client_address.port() + 1),
                sent_at: Instant::now(),
            },
        );

        let response = ResponseSpecific::Ping(PingResponseArguments {
            responder_id: Id::random(),
        });

        let server_thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            assert!(
                server.recv_from().is_none(),
                "Should not receive a response from wrong address"
            );
        });

        client.response(server_address, &8_u32.to_be_bytes(), response);

        server_thread.join().unwrap();
    }

    #[test]
    fn expired_requests_are_drained() {
        let mut socket = KrpcSocket::new(&Config {
            host: Some([127, 0, 0, 1].into()),
            port: Some(0),
            request_timeout: Duration::from_millis(10),
            ..Default::default()
        })
        .unwrap();

        let to = socket.local_addr();
        let tid = socket.request(
            to,
            RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Ping,
            },
        );

        assert!(socket.timeouts().is_empty());

        thread::sleep(Duration::from_millis(20));

        assert_eq!(socket.timeouts(), vec![(tid, to)]);
        assert!(!socket.inflight(&tid));
    }
}
