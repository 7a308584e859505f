//! Serde representation of KRPC messages, one-to-one with the wire format.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireMessage {
    /// Opaque transaction id, 1 to 4 bytes. Our own requests always use 4.
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Box<[u8]>,

    #[serde(default)]
    #[serde(rename = "v", with = "serde_bytes")]
    pub version: Option<[u8; 4]>,

    #[serde(flatten)]
    pub variant: WireMessageVariant,

    /// The requester's address and port as seen by the responder (BEP_0042).
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub ip: Option<[u8; 6]>,

    /// BEP_0043 read-only flag.
    #[serde(default)]
    #[serde(rename = "ro")]
    pub read_only: Option<i32>,
}

impl WireMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<WireMessage, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub enum WireMessageVariant {
    #[serde(rename = "q")]
    Request(WireRequestVariant),

    #[serde(rename = "r")]
    Response(WireResponseVariant),

    #[serde(rename = "e")]
    Error(WireError),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "q")]
pub enum WireRequestVariant {
    #[serde(rename = "ping")]
    Ping {
        #[serde(rename = "a")]
        arguments: PingRequest,
    },

    #[serde(rename = "find_node")]
    FindNode {
        #[serde(rename = "a")]
        arguments: FindNodeRequest,
    },

    #[serde(rename = "get_peers")]
    GetPeers {
        #[serde(rename = "a")]
        arguments: GetPeersRequest,
    },

    #[serde(rename = "announce_peer")]
    AnnouncePeer {
        #[serde(rename = "a")]
        arguments: AnnouncePeerRequest,
    },

    #[serde(rename = "get")]
    GetValue {
        #[serde(rename = "a")]
        arguments: GetValueRequest,
    },

    #[serde(rename = "put")]
    PutValue {
        #[serde(rename = "a")]
        arguments: PutValueRequest,
    },
}

// Untagged, so order matters; keep these from most to least detailed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum WireResponseVariant {
    GetMutable {
        #[serde(rename = "r")]
        arguments: GetMutableResponse,
    },

    NoMoreRecentValue {
        #[serde(rename = "r")]
        arguments: NoMoreRecentValueResponse,
    },

    GetImmutable {
        #[serde(rename = "r")]
        arguments: GetImmutableResponse,
    },

    GetPeers {
        #[serde(rename = "r")]
        arguments: GetPeersResponse,
    },

    NoValues {
        #[serde(rename = "r")]
        arguments: NoValuesResponse,
    },

    FindNode {
        #[serde(rename = "r")]
        arguments: FindNodeResponse,
    },

    Ping {
        #[serde(rename = "r")]
        arguments: PingResponse,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireError {
    #[serde(rename = "e")]
    pub error_info: (i32, String),
}

// === Ping ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PingRequest {
    #[serde(with = "serde_bytes")]
    pub id: [u8; 20],
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PingResponse {
    #[serde(with = "serde_bytes")]
    pub id: [u8; 20],
}

// === Find node ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FindNodeRequest {
    #[serde(with = "serde_bytes")]
    pub id: [u8; 20],

    #[serde(with = "serde_bytes")]
    pub target: [u8; 20],
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FindNodeResponse {
    #[serde(with = "serde_bytes")]
    pub id: [u8; 20],

    #[serde(with = "serde_bytes")]
    pub nodes: Box<[u8]>,
}

// === Get peers ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GetPeersRequest {
    #[serde(with = "serde_bytes")]
    pub id: [u8; 20],

    #[serde(with = "serde_bytes")]
    pub info_hash: [u8; 20],
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GetPeersResponse {
    #[serde(with = "serde_bytes")]
    pub id: [u8; 20],

    #[serde(with = "serde_bytes")]
    pub token: Box<[u8]>,

    #[serde(with = "serde_bytes")]
    #[serde(default)]
    pub nodes: Option<Box<[u8]>>,

    // Not optional; a reply without values decodes as NoValuesResponse.
    pub values: Vec<ByteBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NoValuesResponse {
    #[serde(with = "serde_bytes")]
    pub id: [u8; 20],

    #[serde(with = "serde_bytes")]
    pub token: Box<[u8]>,

    #[serde(with = "serde_bytes")]
    #[serde(default)]
    pub nodes: Option<Box<[u8]>>,
}

// === Announce peer ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AnnouncePeerRequest {
    #[serde(with = "serde_bytes")]
    pub id: [u8; 20],

    #[serde(with = "serde_bytes")]
    pub info_hash: [u8; 20],

    pub port: u16,

    #[serde(with = "serde_bytes")]
    pub token: Box<[u8]>,

    #[serde(default)]
    pub implied_port: Option<u8>,
}

// === Get value ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GetValueRequest {
    #[serde(with = "serde_bytes")]
    pub id: [u8; 20],

    #[serde(with = "serde_bytes")]
    pub target: [u8; 20],

    #[serde(default)]
    pub seq: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GetImmutableResponse {
    #[serde(with = "serde_bytes")]
    pub id: [u8; 20],

    #[serde(with = "serde_bytes")]
    pub token: Box<[u8]>,

    #[serde(with = "serde_bytes")]
    #[serde(default)]
    pub nodes: Option<Box<[u8]>>,

    #[serde(with = "serde_bytes")]
    pub v: Box<[u8]>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GetMutableResponse {
    #[serde(with = "serde_bytes")]
    pub id: [u8; 20],

    #[serde(with = "serde_bytes")]
    pub token: Box<[u8]>,

    #[serde(with = "serde_bytes")]
    #[serde(default)]
    pub nodes: Option<Box<[u8]>>,

    #[serde(with = "serde_bytes")]
    pub v: Box<[u8]>,

    #[serde(with = "serde_bytes")]
    pub k: [u8; 32],

    #[serde(with = "serde_bytes")]
    pub sig: [u8; 64],

    pub seq: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NoMoreRecentValueResponse {
    #[serde(with = "serde_bytes")]
    pub id: [u8; 20],

    #[serde(with = "serde_bytes")]
    pub token: Box<[u8]>,

    #[serde(with = "serde_bytes")]
    #[serde(default)]
    pub nodes: Option<Box<[u8]>>,

    pub seq: i64,
}

// === Put value ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PutValueRequest {
    #[serde(with = "serde_bytes")]
    pub id: [u8; 20],

    #[serde(with = "serde_bytes")]
    pub target: [u8; 20],

    #[serde(with = "serde_bytes")]
    pub token: Box<[u8]>,

    #[serde(with = "serde_bytes")]
    pub v: Box<[u8]>,

    #[serde(with = "serde_bytes")]
    #[serde(default)]
    pub k: Option<[u8; 32]>,

    #[serde(with = "serde_bytes")]
    #[serde(default)]
    pub sig: Option<[u8; 64]>,

    #[serde(default)]
    pub seq: Option<i64>,

    #[serde(default)]
    pub cas: Option<i64>,

    #[serde(with = "serde_bytes")]
    #[serde(default)]
    pub salt: Option<Box<[u8]>>,
}
