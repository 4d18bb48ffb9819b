//! PeaDrop wire protocol: header classes, discovery datagram and version.

use serde::{Deserialize, Serialize};

use crate::item::ItemKind;

/// Application tag carried by every initiation header and discovery datagram.
pub const APP_NAME: &str = "peadrop";

/// Current protocol version. Informational; peers only have to agree on `APP_NAME`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Well-known port shared by the TCP listener and the UDP responder.
pub const DEFAULT_PORT: u16 = 52637;

/// Every header that can appear on a job's TCP stream. Encoding is compact JSON,
/// discriminated by the `class` field (see the wire module for framing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "kebab-case")]
pub enum Header {
    /// Initiator wants to push `num_items` items to the listener.
    #[serde(rename_all = "camelCase")]
    SendRequest {
        app: String,
        version: u8,
        id: String,
        num_items: usize,
    },
    /// Initiator wants to pull whatever the listener decides to share.
    #[serde(rename_all = "camelCase")]
    RecvRequest {
        app: String,
        version: u8,
        id: String,
        num_items: usize,
    },
    /// Handshake accept, per-item acknowledgment, or (with `size`) a chunk header
    /// followed by exactly `size` payload bytes.
    #[serde(rename_all = "camelCase")]
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        num_items: Option<usize>,
    },
    /// Handshake reject.
    No,
    /// Cancellation, either direction, any phase.
    End,
    /// Item announcement. `size` is present for files.
    #[serde(rename_all = "camelCase")]
    New {
        name: String,
        relative_parent_path: String,
        kind: ItemKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
    },
    /// Receiver could not take the current item; sender moves on.
    Skip,
    /// Sender exhausted its item list.
    Done,
}

impl Header {
    pub fn send_request(id: &str, num_items: usize) -> Self {
        Header::SendRequest {
            app: APP_NAME.to_string(),
            version: PROTOCOL_VERSION,
            id: id.to_string(),
            num_items,
        }
    }

    /// `num_items` is 0 on the wire: the initiator does not know what will be offered.
    pub fn recv_request(id: &str) -> Self {
        Header::RecvRequest {
            app: APP_NAME.to_string(),
            version: PROTOCOL_VERSION,
            id: id.to_string(),
            num_items: 0,
        }
    }

    /// Plain acknowledgment (also the handshake accept for send requests).
    pub fn ack() -> Self {
        Header::Ok {
            size: None,
            num_items: None,
        }
    }

    /// Handshake accept for a recv request, announcing how many items follow.
    pub fn accept_with_items(num_items: usize) -> Self {
        Header::Ok {
            size: None,
            num_items: Some(num_items),
        }
    }

    pub fn chunk(size: u64) -> Self {
        Header::Ok {
            size: Some(size),
            num_items: None,
        }
    }

    /// Number of raw payload bytes that follow this header on the stream.
    pub fn payload_len(&self) -> u64 {
        match self {
            Header::Ok { size: Some(n), .. } => *n,
            _ => 0,
        }
    }

    /// Short class name for logs.
    pub fn class(&self) -> &'static str {
        match self {
            Header::SendRequest { .. } => "send-request",
            Header::RecvRequest { .. } => "recv-request",
            Header::Ok { size: Some(_), .. } => "ok/chunk",
            Header::Ok { .. } => "ok",
            Header::No => "no",
            Header::End => "end",
            Header::New { .. } => "new",
            Header::Skip => "skip",
            Header::Done => "done",
        }
    }
}

/// Identity advertised over UDP, both in probes and in the replies to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub app: String,
    pub version: u8,
    pub id: String,
    pub os: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "lowercase")]
enum Datagram {
    Probe(Presence),
}

impl Presence {
    /// Presence for this build, running on the current OS.
    pub fn local(id: &str) -> Self {
        Self {
            app: APP_NAME.to_string(),
            version: PROTOCOL_VERSION,
            id: id.to_string(),
            os: std::env::consts::OS.to_string(),
        }
    }

    /// Single-packet JSON encoding: `{app, version, class: "probe", id, os}`.
    pub fn to_datagram(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&Datagram::Probe(self.clone()))
    }

    /// Parse a datagram. Returns None for anything malformed, incomplete or from another app.
    pub fn from_datagram(bytes: &[u8]) -> Option<Self> {
        let Datagram::Probe(presence) = serde_json::from_slice::<Datagram>(bytes).ok()?;
        if presence.app != APP_NAME || presence.id.is_empty() {
            return None;
        }
        Some(presence)
    }
}
