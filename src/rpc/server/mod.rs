//! Handling incoming requests: the server side of the four base queries
//! and the BEP_0044 storage extension.

pub mod peers;
pub mod tokens;
pub mod values;

use std::net::SocketAddrV4;

use bytes::Bytes;
use tracing::debug;

use crate::common::{
    AnnouncePeerRequestArguments, ErrorSpecific, FindNodeRequestArguments,
    FindNodeResponseArguments, GetImmutableResponseArguments, GetMutableResponseArguments,
    GetPeersRequestArguments, GetPeersResponseArguments, GetValueRequestArguments, Id, MessageType,
    MutableError, MutableItem, NoMoreRecentValueResponseArguments, NoValuesResponseArguments,
    PingResponseArguments, PutImmutableRequestArguments, PutMutableRequestArguments, PutRequest,
    PutRequestSpecific, RequestSpecific, RequestTypeSpecific, ResponseSpecific, RoutingTable,
    MAX_VALUE_SIZE,
};
use crate::common::{validate_immutable, MAX_SALT_SIZE};

use peers::PeersStore;
use tokens::Tokens;
use values::ValueStore;

/// Answers incoming queries against the local stores.
///
/// Supports [BEP_0005](https://www.bittorrent.org/beps/bep_0005.html) and
/// [BEP_0044](https://www.bittorrent.org/beps/bep_0044.html), without any
/// rate-limiting or blocking.
#[derive(Debug, Default)]
pub struct Server {
    /// Write-token generator.
    tokens: Tokens,
    /// Announced peers per info_hash.
    peers: PeersStore,
    /// Immutable values store.
    immutable_values: ValueStore<Box<[u8]>>,
    /// Mutable values store.
    mutable_values: ValueStore<MutableItem>,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a response or an error for an incoming request, for the Rpc
    /// to send back to the requester.
    pub fn handle_request(
        &mut self,
        routing_table: &RoutingTable,
        from: SocketAddrV4,
        request: RequestSpecific,
    ) -> MessageType {
        // Lazily rotate the token secret before handling a request.
        if self.tokens.should_rotate() {
            self.tokens.rotate()
        }

        let requester_id = request.requester_id;

        match request.request_type {
            RequestTypeSpecific::Ping => {
                MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                    responder_id: *routing_table.id(),
                }))
            }
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }) => {
                MessageType::Response(ResponseSpecific::FindNode(FindNodeResponseArguments {
                    responder_id: *routing_table.id(),
                    nodes: self.closest_nodes(routing_table, &target),
                }))
            }
            RequestTypeSpecific::GetPeers(GetPeersRequestArguments { info_hash }) => {
                MessageType::Response(match self.peers.get_random_peers(&info_hash) {
                    Some(peers) => ResponseSpecific::GetPeers(GetPeersResponseArguments {
                        responder_id: *routing_table.id(),
                        token: self.tokens.generate(&info_hash, from).into(),
                        nodes: Some(self.closest_nodes(routing_table, &info_hash)),
                        values: peers,
                    }),
                    None => ResponseSpecific::NoValues(NoValuesResponseArguments {
                        responder_id: *routing_table.id(),
                        token: self.tokens.generate(&info_hash, from).into(),
                        nodes: Some(self.closest_nodes(routing_table, &info_hash)),
                    }),
                })
            }
            RequestTypeSpecific::GetValue(GetValueRequestArguments { target, seq, .. }) => {
                if seq.is_some() {
                    MessageType::Response(self.handle_get_mutable(routing_table, from, target, seq))
                } else if let Some(v) = self.immutable_values.get(&target).cloned() {
                    MessageType::Response(ResponseSpecific::GetImmutable(
                        GetImmutableResponseArguments {
                            responder_id: *routing_table.id(),
                            token: self.tokens.generate(&target, from).into(),
                            nodes: Some(self.closest_nodes(routing_table, &target)),
                            v,
                        },
                    ))
                } else {
                    MessageType::Response(self.handle_get_mutable(routing_table, from, target, seq))
                }
            }
            RequestTypeSpecific::Put(PutRequest {
                token,
                put_request_type,
            }) => match put_request_type {
                PutRequestSpecific::AnnouncePeer(AnnouncePeerRequestArguments {
                    info_hash,
                    port,
                    implied_port,
                }) => {
                    if !self.tokens.validate(&info_hash, from, &token) {
                        debug!(
                            ?info_hash,
                            ?requester_id,
                            ?from,
                            request_type = "announce_peer",
                            "Invalid token"
                        );

                        return MessageType::Error(ErrorSpecific {
                            code: 203,
                            description: "Bad token".to_string(),
                        });
                    }

                    let peer = match implied_port {
                        Some(true) => from,
                        _ => SocketAddrV4::new(*from.ip(), port),
                    };

                    self.peers.add_peer(info_hash, peer);

                    MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                        responder_id: *routing_table.id(),
                    }))
                }
                PutRequestSpecific::PutImmutable(PutImmutableRequestArguments { target, v }) => {
                    if !self.tokens.validate(&target, from, &token) {
                        debug!(
                            ?target,
                            ?requester_id,
                            ?from,
                            request_type = "put_immutable",
                            "Invalid token"
                        );

                        return MessageType::Error(ErrorSpecific {
                            code: 203,
                            description: "Bad token".to_string(),
                        });
                    }

                    if v.len() > MAX_VALUE_SIZE {
                        return MessageType::Error(ErrorSpecific {
                            code: 205,
                            description: "Message (v field) too big".to_string(),
                        });
                    }

                    if !validate_immutable(&v, &target) {
                        debug!(?target, ?requester_id, ?from, "Target mismatch");

                        return MessageType::Error(ErrorSpecific {
                            code: 203,
                            description: "Target doesn't match the sha1 hash of v field"
                                .to_string(),
                        });
                    }

                    self.immutable_values.put(target, v);

                    MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                        responder_id: *routing_table.id(),
                    }))
                }
                PutRequestSpecific::PutMutable(PutMutableRequestArguments {
                    target,
                    v,
                    k,
                    seq,
                    sig,
                    salt,
                    cas,
                }) => {
                    if !self.tokens.validate(&target, from, &token) {
                        debug!(
                            ?target,
                            ?requester_id,
                            ?from,
                            request_type = "put_mutable",
                            "Invalid token"
                        );

                        return MessageType::Error(ErrorSpecific {
                            code: 203,
                            description: "Bad token".to_string(),
                        });
                    }

                    if v.len() > MAX_VALUE_SIZE {
                        return MessageType::Error(ErrorSpecific {
                            code: 205,
                            description: "Message (v field) too big".to_string(),
                        });
                    }

                    if salt.as_ref().map(|salt| salt.len() > MAX_SALT_SIZE) == Some(true) {
                        return MessageType::Error(ErrorSpecific {
                            code: 207,
                            description: "salt (salt field) too big".to_string(),
                        });
                    }

                    if let Some(previous) = self.mutable_values.get(&target) {
                        if let Some(cas) = cas {
                            if previous.seq() != cas {
                                debug!(?target, ?requester_id, ?from, "CAS mismatch");

                                return MessageType::Error(ErrorSpecific {
                                    code: 301,
                                    description: "CAS mismatched, re-read value and try again"
                                        .to_string(),
                                });
                            }
                        }

                        if seq < previous.seq() {
                            debug!(
                                ?target,
                                ?requester_id,
                                ?from,
                                "Sequence number less than current"
                            );

                            return MessageType::Error(ErrorSpecific {
                                code: 302,
                                description: "Sequence number less than current".to_string(),
                            });
                        }
                    }

                    match MutableItem::from_dht_message(
                        &target,
                        &k,
                        Bytes::from(v.into_vec()),
                        seq,
                        &sig,
                        salt.map(|s| Bytes::from(s.into_vec())),
                        cas,
                    ) {
                        Ok(item) => {
                            self.mutable_values.put(target, item);

                            MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                                responder_id: *routing_table.id(),
                            }))
                        }
                        Err(MutableError::TargetMismatch) => {
                            debug!(?target, ?requester_id, ?from, "Mutable target mismatch");

                            MessageType::Error(ErrorSpecific {
                                code: 203,
                                description: "Target doesn't match the key and salt".to_string(),
                            })
                        }
                        Err(error) => {
                            debug!(?target, ?requester_id, ?from, ?error, "Invalid signature");

                            MessageType::Error(ErrorSpecific {
                                code: 206,
                                description: "Invalid signature".to_string(),
                            })
                        }
                    }
                }
            },
        }
    }

    /// The peers announced to this node for an info_hash.
    pub(crate) fn announced_peers(&mut self, info_hash: &Id) -> Vec<SocketAddrV4> {
        self.peers.get_random_peers(info_hash).unwrap_or_default()
    }

    /// A locally stored immutable value, if any.
    pub(crate) fn immutable_value(&mut self, target: &Id) -> Option<&Box<[u8]>> {
        self.immutable_values.get(target)
    }

    /// A locally stored mutable item, if any.
    pub(crate) fn mutable_value(&mut self, target: &Id) -> Option<&MutableItem> {
        self.mutable_values.get(target)
    }

    // === Private Methods ===

    fn closest_nodes(
        &self,
        routing_table: &RoutingTable,
        target: &Id,
    ) -> Box<[crate::common::Node]> {
        routing_table
            .closest(target, routing_table.bucket_size())
            .into()
    }

    fn handle_get_mutable(
        &mut self,
        routing_table: &RoutingTable,
        from: SocketAddrV4,
        target: Id,
        seq: Option<i64>,
    ) -> ResponseSpecific {
        let nodes = Some(self.closest_nodes(routing_table, &target));
        let token = self.tokens.generate(&target, from).into();

        match self.mutable_values.get(&target) {
            Some(item) => {
                let no_more_recent_value = seq.map(|request_seq| item.seq() <= request_seq);

                match no_more_recent_value {
                    Some(true) => {
                        ResponseSpecific::NoMoreRecentValue(NoMoreRecentValueResponseArguments {
                            responder_id: *routing_table.id(),
                            token,
                            nodes,
                            seq: item.seq(),
                        })
                    }
                    _ => ResponseSpecific::GetMutable(GetMutableResponseArguments {
                        responder_id: *routing_table.id(),
                        token,
                        nodes,
                        v: item.value().to_vec().into(),
                        k: *item.key(),
                        seq: item.seq(),
                        sig: *item.signature(),
                    }),
                }
            }
            None => ResponseSpecific::NoValues(NoValuesResponseArguments {
                responder_id: *routing_table.id(),
                token,
                nodes,
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::hash_immutable;

    fn server_setup() -> (Server, RoutingTable, SocketAddrV4) {
        (
            Server::new(),
            RoutingTable::new(Id::random()),
            SocketAddrV4::new([127, 0, 0, 1].into(), 6881),
        )
    }

    fn issue_token(server: &mut Server, target: &Id, from: SocketAddrV4) -> Box<[u8]> {
        server.tokens.generate(target, from).into()
    }

    #[test]
    fn ping_responds_with_own_id() {
        let (mut server, table, from) = server_setup();

        let response = server.handle_request(
            &table,
            from,
            RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Ping,
            },
        );

        assert_eq!(
            response,
            MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                responder_id: *table.id(),
            }))
        );
    }

    #[test]
    fn announce_peer_with_bad_token_rejected() {
        let (mut server, table, from) = server_setup();

        let response = server.handle_request(
            &table,
            from,
            RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Put(PutRequest {
                    token: vec![1, 2, 3].into(),
                    put_request_type: PutRequestSpecific::AnnouncePeer(
                        AnnouncePeerRequestArguments {
                            info_hash: Id::random(),
                            port: 1234,
                            implied_port: None,
                        },
                    ),
                }),
            },
        );

        assert!(matches!(
            response,
            MessageType::Error(ErrorSpecific { code: 203, .. })
        ));
    }

    #[test]
    fn announce_peer_implied_port_uses_source_port() {
        let (mut server, table, from) = server_setup();
        let info_hash = Id::random();

        let token = issue_token(&mut server, &info_hash, from);

        server.handle_request(
            &table,
            from,
            RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Put(PutRequest {
                    token,
                    put_request_type: PutRequestSpecific::AnnouncePeer(
                        AnnouncePeerRequestArguments {
                            info_hash,
                            port: 9999,
                            implied_port: Some(true),
                        },
                    ),
                }),
            },
        );

        assert_eq!(server.peers.get_random_peers(&info_hash), Some(vec![from]));
    }

    #[test]
    fn put_then_get_immutable() {
        let (mut server, table, from) = server_setup();

        let v: Box<[u8]> = b"stored value".to_vec().into();
        let target = Id::from_bytes(hash_immutable(&v)).unwrap();
        let token = issue_token(&mut server, &target, from);

        let response = server.handle_request(
            &table,
            from,
            RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Put(PutRequest {
                    token,
                    put_request_type: PutRequestSpecific::PutImmutable(
                        PutImmutableRequestArguments {
                            target,
                            v: v.clone(),
                        },
                    ),
                }),
            },
        );
        assert!(matches!(response, MessageType::Response(_)));

        let response = server.handle_request(
            &table,
            from,
            RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::GetValue(GetValueRequestArguments {
                    target,
                    seq: None,
                    salt: None,
                }),
            },
        );

        let MessageType::Response(ResponseSpecific::GetImmutable(arguments)) = response else {
            panic!("expected a GetImmutable response");
        };
        assert_eq!(arguments.v, v);
    }

    #[test]
    fn put_immutable_target_mismatch_rejected() {
        let (mut server, table, from) = server_setup();

        let target = Id::random();
        let token = issue_token(&mut server, &target, from);

        let response = server.handle_request(
            &table,
            from,
            RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Put(PutRequest {
                    token,
                    put_request_type: PutRequestSpecific::PutImmutable(
                        PutImmutableRequestArguments {
                            target,
                            v: b"whatever".to_vec().into(),
                        },
                    ),
                }),
            },
        );

        assert!(matches!(
            response,
            MessageType::Error(ErrorSpecific { code: 203, .. })
        ));
    }

    #[test]
    fn put_mutable_stale_seq_rejected() {
        let (mut server, table, from) = server_setup();

        let signer = ed25519_dalek::SigningKey::from_bytes(&[7_u8; 32]);

        let put = |seq: i64| {
            let item = MutableItem::new(signer.clone(), Bytes::from(vec![b'v']), seq, None);
            PutRequestSpecific::PutMutable(PutMutableRequestArguments {
                target: *item.target(),
                v: item.value().to_vec().into(),
                k: *item.key(),
                seq: item.seq(),
                sig: *item.signature(),
                salt: None,
                cas: None,
            })
        };

        let target = *MutableItem::new(signer.clone(), Bytes::from(vec![b'v']), 0, None).target();
        let token = issue_token(&mut server, &target, from);

        let response = server.handle_request(
            &table,
            from,
            RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Put(PutRequest {
                    token: token.clone(),
                    put_request_type: put(3),
                }),
            },
        );
        assert!(matches!(response, MessageType::Response(_)));

        let response = server.handle_request(
            &table,
            from,
            RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Put(PutRequest {
                    token,
                    put_request_type: put(2),
                }),
            },
        );

        assert!(matches!(
            response,
            MessageType::Error(ErrorSpecific { code: 302, .. })
        ));
    }
}
