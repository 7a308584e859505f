//! Typed KRPC messages and the compact node/peer codecs.

mod internal;

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::common::{Id, InvalidIdSize, Node, ID_SIZE};

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    /// Opaque transaction id, 1 to 4 bytes, echoed verbatim on responses.
    pub transaction_id: Box<[u8]>,

    /// The version of the requester or responder.
    pub version: Option<[u8; 4]>,

    /// The address and port of the requester as seen from the responder's
    /// point of view. Only set on responses.
    pub requester_ip: Option<SocketAddrV4>,

    pub message_type: MessageType,

    /// BEP_0043. When set on a request, the requester can't answer queries and
    /// should not be added to routing tables.
    pub read_only: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

#[derive(Debug, PartialEq, Clone)]
pub struct RequestSpecific {
    pub requester_id: Id,
    pub request_type: RequestTypeSpecific,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestTypeSpecific {
    Ping,
    FindNode(FindNodeRequestArguments),
    GetPeers(GetPeersRequestArguments),
    GetValue(GetValueRequestArguments),

    Put(PutRequest),
}

#[derive(Debug, PartialEq, Clone)]
pub struct PutRequest {
    pub token: Box<[u8]>,
    pub put_request_type: PutRequestSpecific,
}

#[derive(Debug, PartialEq, Clone)]
pub enum PutRequestSpecific {
    AnnouncePeer(AnnouncePeerRequestArguments),
    PutImmutable(PutImmutableRequestArguments),
    PutMutable(PutMutableRequestArguments),
}

impl PutRequestSpecific {
    /// The id this request stores data at.
    pub fn target(&self) -> &Id {
        match self {
            PutRequestSpecific::AnnouncePeer(AnnouncePeerRequestArguments {
                info_hash, ..
            }) => info_hash,
            PutRequestSpecific::PutMutable(PutMutableRequestArguments { target, .. }) => target,
            PutRequestSpecific::PutImmutable(PutImmutableRequestArguments { target, .. }) => target,
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    Ping(PingResponseArguments),
    FindNode(FindNodeResponseArguments),
    GetPeers(GetPeersResponseArguments),
    GetImmutable(GetImmutableResponseArguments),
    GetMutable(GetMutableResponseArguments),
    NoValues(NoValuesResponseArguments),
    NoMoreRecentValue(NoMoreRecentValueResponseArguments),
}

// === Ping ===

#[derive(Debug, PartialEq, Clone)]
pub struct PingResponseArguments {
    pub responder_id: Id,
}

// === Find node ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeResponseArguments {
    pub responder_id: Id,
    pub nodes: Box<[Node]>,
}

// === Get peers ===

#[derive(Debug, PartialEq, Clone)]
pub struct GetPeersRequestArguments {
    pub info_hash: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetPeersResponseArguments {
    pub responder_id: Id,
    pub token: Box<[u8]>,
    pub values: Vec<SocketAddrV4>,
    pub nodes: Option<Box<[Node]>>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct NoValuesResponseArguments {
    pub responder_id: Id,
    pub token: Box<[u8]>,
    pub nodes: Option<Box<[Node]>>,
}

// === Announce peer ===

#[derive(Debug, PartialEq, Clone)]
pub struct AnnouncePeerRequestArguments {
    pub info_hash: Id,
    pub port: u16,
    pub implied_port: Option<bool>,
}

// === Get value ===

#[derive(Debug, PartialEq, Clone)]
pub struct GetValueRequestArguments {
    pub target: Id,
    pub seq: Option<i64>,
    // Carries an optional salt alongside the request inside an iterative
    // query, so mutable responses can be validated against the right target.
    // Never encoded or sent over the wire.
    pub salt: Option<Box<[u8]>>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetImmutableResponseArguments {
    pub responder_id: Id,
    pub token: Box<[u8]>,
    pub nodes: Option<Box<[Node]>>,
    pub v: Box<[u8]>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetMutableResponseArguments {
    pub responder_id: Id,
    pub token: Box<[u8]>,
    pub nodes: Option<Box<[Node]>>,
    pub v: Box<[u8]>,
    pub k: [u8; 32],
    pub seq: i64,
    pub sig: [u8; 64],
}

#[derive(Debug, PartialEq, Clone)]
pub struct NoMoreRecentValueResponseArguments {
    pub responder_id: Id,
    pub token: Box<[u8]>,
    pub nodes: Option<Box<[Node]>>,
    pub seq: i64,
}

// === Put ===

#[derive(Debug, PartialEq, Clone)]
pub struct PutImmutableRequestArguments {
    pub target: Id,
    pub v: Box<[u8]>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct PutMutableRequestArguments {
    pub target: Id,
    pub v: Box<[u8]>,
    pub k: [u8; 32],
    pub seq: i64,
    pub sig: [u8; 64],
    pub salt: Option<Box<[u8]>>,
    pub cas: Option<i64>,
}

impl Message {
    fn into_wire_message(self) -> internal::WireMessage {
        internal::WireMessage {
            transaction_id: self.transaction_id,
            version: self.version,
            ip: self.requester_ip.map(|sockaddr| sockaddr_to_bytes(sockaddr)),
            read_only: if self.read_only { Some(1) } else { None },
            variant: match self.message_type {
                MessageType::Request(RequestSpecific {
                    requester_id,
                    request_type,
                }) => internal::WireMessageVariant::Request(match request_type {
                    RequestTypeSpecific::Ping => internal::WireRequestVariant::Ping {
                        arguments: internal::PingRequest {
                            id: requester_id.0,
                        },
                    },
                    RequestTypeSpecific::FindNode(args) => {
                        internal::WireRequestVariant::FindNode {
                            arguments: internal::FindNodeRequest {
                                id: requester_id.0,
                                target: args.target.0,
                            },
                        }
                    }
                    RequestTypeSpecific::GetPeers(args) => {
                        internal::WireRequestVariant::GetPeers {
                            arguments: internal::GetPeersRequest {
                                id: requester_id.0,
                                info_hash: args.info_hash.0,
                            },
                        }
                    }
                    RequestTypeSpecific::GetValue(args) => {
                        internal::WireRequestVariant::GetValue {
                            arguments: internal::GetValueRequest {
                                id: requester_id.0,
                                target: args.target.0,
                                seq: args.seq,
                            },
                        }
                    }
                    RequestTypeSpecific::Put(PutRequest {
                        token,
                        put_request_type,
                    }) => match put_request_type {
                        PutRequestSpecific::AnnouncePeer(args) => {
                            internal::WireRequestVariant::AnnouncePeer {
                                arguments: internal::AnnouncePeerRequest {
                                    id: requester_id.0,
                                    token,
                                    info_hash: args.info_hash.0,
                                    port: args.port,
                                    implied_port: args.implied_port.map(u8::from),
                                },
                            }
                        }
                        PutRequestSpecific::PutImmutable(args) => {
                            internal::WireRequestVariant::PutValue {
                                arguments: internal::PutValueRequest {
                                    id: requester_id.0,
                                    token,
                                    target: args.target.0,
                                    v: args.v,
                                    k: None,
                                    seq: None,
                                    sig: None,
                                    salt: None,
                                    cas: None,
                                },
                            }
                        }
                        PutRequestSpecific::PutMutable(args) => {
                            internal::WireRequestVariant::PutValue {
                                arguments: internal::PutValueRequest {
                                    id: requester_id.0,
                                    token,
                                    target: args.target.0,
                                    v: args.v,
                                    k: Some(args.k),
                                    seq: Some(args.seq),
                                    sig: Some(args.sig),
                                    salt: args.salt,
                                    cas: args.cas,
                                },
                            }
                        }
                    },
                }),

                MessageType::Response(response) => {
                    internal::WireMessageVariant::Response(match response {
                        ResponseSpecific::Ping(args) => internal::WireResponseVariant::Ping {
                            arguments: internal::PingResponse {
                                id: args.responder_id.0,
                            },
                        },
                        ResponseSpecific::FindNode(args) => {
                            internal::WireResponseVariant::FindNode {
                                arguments: internal::FindNodeResponse {
                                    id: args.responder_id.0,
                                    nodes: nodes_to_bytes(&args.nodes),
                                },
                            }
                        }
                        ResponseSpecific::GetPeers(args) => {
                            internal::WireResponseVariant::GetPeers {
                                arguments: internal::GetPeersResponse {
                                    id: args.responder_id.0,
                                    token: args.token,
                                    nodes: args.nodes.as_deref().map(nodes_to_bytes),
                                    values: peers_to_bytes(&args.values),
                                },
                            }
                        }
                        ResponseSpecific::NoValues(args) => {
                            internal::WireResponseVariant::NoValues {
                                arguments: internal::NoValuesResponse {
                                    id: args.responder_id.0,
                                    token: args.token,
                                    nodes: args.nodes.as_deref().map(nodes_to_bytes),
                                },
                            }
                        }
                        ResponseSpecific::GetImmutable(args) => {
                            internal::WireResponseVariant::GetImmutable {
                                arguments: internal::GetImmutableResponse {
                                    id: args.responder_id.0,
                                    token: args.token,
                                    nodes: args.nodes.as_deref().map(nodes_to_bytes),
                                    v: args.v,
                                },
                            }
                        }
                        ResponseSpecific::GetMutable(args) => {
                            internal::WireResponseVariant::GetMutable {
                                arguments: internal::GetMutableResponse {
                                    id: args.responder_id.0,
                                    token: args.token,
                                    nodes: args.nodes.as_deref().map(nodes_to_bytes),
                                    v: args.v,
                                    k: args.k,
                                    seq: args.seq,
                                    sig: args.sig,
                                },
                            }
                        }
                        ResponseSpecific::NoMoreRecentValue(args) => {
                            internal::WireResponseVariant::NoMoreRecentValue {
                                arguments: internal::NoMoreRecentValueResponse {
                                    id: args.responder_id.0,
                                    token: args.token,
                                    nodes: args.nodes.as_deref().map(nodes_to_bytes),
                                    seq: args.seq,
                                },
                            }
                        }
                    })
                }

                MessageType::Error(err) => internal::WireMessageVariant::Error(internal::WireError {
                    error_info: (err.code, err.description),
                }),
            },
        }
    }

    fn from_wire_message(msg: internal::WireMessage) -> Result<Message, DecodeMessageError> {
        if msg.transaction_id.is_empty() || msg.transaction_id.len() > 4 {
            return Err(DecodeMessageError::InvalidTransactionId(
                msg.transaction_id.to_vec(),
            ));
        }

        Ok(Message {
            transaction_id: msg.transaction_id,
            version: msg.version,
            requester_ip: match msg.ip {
                Some(ip) => Some(bytes_to_sockaddr(ip)?),
                _ => None,
            },
            read_only: msg.read_only.map(|ro| ro > 0).unwrap_or(false),
            message_type: match msg.variant {
                internal::WireMessageVariant::Request(request) => {
                    MessageType::Request(match request {
                        internal::WireRequestVariant::Ping { arguments } => RequestSpecific {
                            requester_id: Id(arguments.id),
                            request_type: RequestTypeSpecific::Ping,
                        },
                        internal::WireRequestVariant::FindNode { arguments } => RequestSpecific {
                            requester_id: Id(arguments.id),
                            request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                                target: Id(arguments.target),
                            }),
                        },
                        internal::WireRequestVariant::GetPeers { arguments } => RequestSpecific {
                            requester_id: Id(arguments.id),
                            request_type: RequestTypeSpecific::GetPeers(GetPeersRequestArguments {
                                info_hash: Id(arguments.info_hash),
                            }),
                        },
                        internal::WireRequestVariant::GetValue { arguments } => RequestSpecific {
                            requester_id: Id(arguments.id),
                            request_type: RequestTypeSpecific::GetValue(GetValueRequestArguments {
                                target: Id(arguments.target),
                                seq: arguments.seq,
                                salt: None,
                            }),
                        },
                        internal::WireRequestVariant::AnnouncePeer { arguments } => {
                            RequestSpecific {
                                requester_id: Id(arguments.id),
                                request_type: RequestTypeSpecific::Put(PutRequest {
                                    token: arguments.token,
                                    put_request_type: PutRequestSpecific::AnnouncePeer(
                                        AnnouncePeerRequestArguments {
                                            info_hash: Id(arguments.info_hash),
                                            port: arguments.port,
                                            implied_port: arguments
                                                .implied_port
                                                .map(|implied_port| implied_port != 0),
                                        },
                                    ),
                                }),
                            }
                        }
                        internal::WireRequestVariant::PutValue { arguments } => {
                            let put_request_type = if let Some(k) = arguments.k {
                                PutRequestSpecific::PutMutable(PutMutableRequestArguments {
                                    target: Id(arguments.target),
                                    v: arguments.v,
                                    k,
                                    seq: arguments
                                        .seq
                                        .ok_or(DecodeMessageError::MissingMutableField("seq"))?,
                                    sig: arguments
                                        .sig
                                        .ok_or(DecodeMessageError::MissingMutableField("sig"))?,
                                    salt: arguments.salt,
                                    cas: arguments.cas,
                                })
                            } else {
                                PutRequestSpecific::PutImmutable(PutImmutableRequestArguments {
                                    target: Id(arguments.target),
                                    v: arguments.v,
                                })
                            };

                            RequestSpecific {
                                requester_id: Id(arguments.id),
                                request_type: RequestTypeSpecific::Put(PutRequest {
                                    token: arguments.token,
                                    put_request_type,
                                }),
                            }
                        }
                    })
                }

                internal::WireMessageVariant::Response(response) => {
                    MessageType::Response(match response {
                        internal::WireResponseVariant::Ping { arguments } => {
                            ResponseSpecific::Ping(PingResponseArguments {
                                responder_id: Id(arguments.id),
                            })
                        }
                        internal::WireResponseVariant::FindNode { arguments } => {
                            ResponseSpecific::FindNode(FindNodeResponseArguments {
                                responder_id: Id(arguments.id),
                                nodes: bytes_to_nodes(&arguments.nodes)?,
                            })
                        }
                        internal::WireResponseVariant::GetPeers { arguments } => {
                            ResponseSpecific::GetPeers(GetPeersResponseArguments {
                                responder_id: Id(arguments.id),
                                token: arguments.token,
                                nodes: arguments
                                    .nodes
                                    .as_deref()
                                    .map(bytes_to_nodes)
                                    .transpose()?,
                                values: bytes_to_peers(&arguments.values)?,
                            })
                        }
                        internal::WireResponseVariant::NoValues { arguments } => {
                            ResponseSpecific::NoValues(NoValuesResponseArguments {
                                responder_id: Id(arguments.id),
                                token: arguments.token,
                                nodes: arguments
                                    .nodes
                                    .as_deref()
                                    .map(bytes_to_nodes)
                                    .transpose()?,
                            })
                        }
                        internal::WireResponseVariant::GetImmutable { arguments } => {
                            ResponseSpecific::GetImmutable(GetImmutableResponseArguments {
                                responder_id: Id(arguments.id),
                                token: arguments.token,
                                nodes: arguments
                                    .nodes
                                    .as_deref()
                                    .map(bytes_to_nodes)
                                    .transpose()?,
                                v: arguments.v,
                            })
                        }
                        internal::WireResponseVariant::GetMutable { arguments } => {
                            ResponseSpecific::GetMutable(GetMutableResponseArguments {
                                responder_id: Id(arguments.id),
                                token: arguments.token,
                                nodes: arguments
                                    .nodes
                                    .as_deref()
                                    .map(bytes_to_nodes)
                                    .transpose()?,
                                v: arguments.v,
                                k: arguments.k,
                                seq: arguments.seq,
                                sig: arguments.sig,
                            })
                        }
                        internal::WireResponseVariant::NoMoreRecentValue { arguments } => {
                            ResponseSpecific::NoMoreRecentValue(
                                NoMoreRecentValueResponseArguments {
                                    responder_id: Id(arguments.id),
                                    token: arguments.token,
                                    nodes: arguments
                                        .nodes
                                        .as_deref()
                                        .map(bytes_to_nodes)
                                        .transpose()?,
                                    seq: arguments.seq,
                                },
                            )
                        }
                    })
                }

                internal::WireMessageVariant::Error(err) => MessageType::Error(ErrorSpecific {
                    code: err.error_info.0,
                    description: err.error_info.1,
                }),
            },
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        self.clone().into_wire_message().to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message, DecodeMessageError> {
        if bytes.first() != Some(&b'd') {
            return Err(DecodeMessageError::NotBencodeDictionary);
        }

        Message::from_wire_message(internal::WireMessage::from_bytes(bytes)?)
    }

    /// Return the Id of the author of this message, if it carries one
    /// (error messages don't).
    pub fn get_author_id(&self) -> Option<Id> {
        let id = match &self.message_type {
            MessageType::Request(arguments) => arguments.requester_id,
            MessageType::Response(response) => match response {
                ResponseSpecific::Ping(arguments) => arguments.responder_id,
                ResponseSpecific::FindNode(arguments) => arguments.responder_id,
                ResponseSpecific::GetPeers(arguments) => arguments.responder_id,
                ResponseSpecific::GetImmutable(arguments) => arguments.responder_id,
                ResponseSpecific::GetMutable(arguments) => arguments.responder_id,
                ResponseSpecific::NoValues(arguments) => arguments.responder_id,
                ResponseSpecific::NoMoreRecentValue(arguments) => arguments.responder_id,
            },
            MessageType::Error(_) => {
                return None;
            }
        };

        Some(id)
    }

    /// Nodes closer to the target carried by this response, if any.
    pub fn get_closer_nodes(&self) -> Option<&[Node]> {
        match &self.message_type {
            MessageType::Response(response) => match response {
                ResponseSpecific::Ping(_) => None,
                ResponseSpecific::FindNode(arguments) => Some(&arguments.nodes),
                ResponseSpecific::GetPeers(arguments) => arguments.nodes.as_deref(),
                ResponseSpecific::GetMutable(arguments) => arguments.nodes.as_deref(),
                ResponseSpecific::GetImmutable(arguments) => arguments.nodes.as_deref(),
                ResponseSpecific::NoValues(arguments) => arguments.nodes.as_deref(),
                ResponseSpecific::NoMoreRecentValue(arguments) => arguments.nodes.as_deref(),
            },
            _ => None,
        }
    }

    /// The responder id and write token carried by this response, if any.
    pub fn get_token(&self) -> Option<(Id, &[u8])> {
        match &self.message_type {
            MessageType::Response(response) => match response {
                ResponseSpecific::Ping(_) => None,
                ResponseSpecific::FindNode(_) => None,
                ResponseSpecific::GetPeers(arguments) => {
                    Some((arguments.responder_id, &arguments.token))
                }
                ResponseSpecific::GetImmutable(arguments) => {
                    Some((arguments.responder_id, &arguments.token))
                }
                ResponseSpecific::GetMutable(arguments) => {
                    Some((arguments.responder_id, &arguments.token))
                }
                ResponseSpecific::NoValues(arguments) => {
                    Some((arguments.responder_id, &arguments.token))
                }
                ResponseSpecific::NoMoreRecentValue(arguments) => {
                    Some((arguments.responder_id, &arguments.token))
                }
            },
            _ => None,
        }
    }
}

const NODE_BYTE_SIZE: usize = ID_SIZE + 6;

fn bytes_to_sockaddr<T: AsRef<[u8]>>(bytes: T) -> Result<SocketAddrV4, DecodeMessageError> {
    let bytes = bytes.as_ref();
    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);

            let port_bytes: [u8; 2] = bytes[4..6]
                .try_into()
                .expect("infallible, sliced 2 bytes above");

            Ok(SocketAddrV4::new(ip, u16::from_be_bytes(port_bytes)))
        }
        18 => Err(DecodeMessageError::Ipv6Unsupported),
        _ => Err(DecodeMessageError::InvalidSocketAddrEncodingLength),
    }
}

pub(crate) fn sockaddr_to_bytes(sockaddr: SocketAddrV4) -> [u8; 6] {
    let mut bytes = [0_u8; 6];

    bytes[0..4].copy_from_slice(&sockaddr.ip().octets());
    bytes[4..6].copy_from_slice(&sockaddr.port().to_be_bytes());

    bytes
}

fn nodes_to_bytes(nodes: &[Node]) -> Box<[u8]> {
    let mut bytes = Vec::with_capacity(NODE_BYTE_SIZE * nodes.len());

    for node in nodes {
        bytes.extend_from_slice(node.id().as_bytes());
        bytes.extend_from_slice(&sockaddr_to_bytes(node.address()));
    }

    bytes.into_boxed_slice()
}

fn bytes_to_nodes<T: AsRef<[u8]>>(bytes: T) -> Result<Box<[Node]>, DecodeMessageError> {
    let bytes = bytes.as_ref();

    if bytes.len() % NODE_BYTE_SIZE != 0 {
        return Err(DecodeMessageError::InvalidNodesEncodingLength);
    }

    let mut nodes = Vec::with_capacity(bytes.len() / NODE_BYTE_SIZE);
    for chunk in bytes.chunks_exact(NODE_BYTE_SIZE) {
        let id = Id::from_bytes(&chunk[..ID_SIZE])?;
        let sockaddr = bytes_to_sockaddr(&chunk[ID_SIZE..])?;

        nodes.push(Node::new(id, sockaddr));
    }

    Ok(nodes.into_boxed_slice())
}

fn peers_to_bytes(peers: &[SocketAddrV4]) -> Vec<serde_bytes::ByteBuf> {
    peers
        .iter()
        .map(|p| serde_bytes::ByteBuf::from(sockaddr_to_bytes(*p)))
        .collect()
}

fn bytes_to_peers<T: AsRef<[serde_bytes::ByteBuf]>>(
    bytes: T,
) -> Result<Vec<SocketAddrV4>, DecodeMessageError> {
    bytes.as_ref().iter().map(bytes_to_sockaddr).collect()
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeMessageError {
    #[error("Expected message to be a bencode dictionary")]
    NotBencodeDictionary,

    #[error("Expected transaction id of 1 to 4 bytes, got {0:?}")]
    InvalidTransactionId(Vec<u8>),

    #[error("Wrong number of bytes for nodes")]
    InvalidNodesEncodingLength,

    #[error("IPv6 is not supported")]
    Ipv6Unsupported,

    #[error("Wrong number of bytes for sockaddr")]
    InvalidSocketAddrEncodingLength,

    #[error("Mutable put message is missing the {0} field")]
    MissingMutableField(&'static str),

    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error(transparent)]
    InvalidIdSize(#[from] InvalidIdSize),
}
