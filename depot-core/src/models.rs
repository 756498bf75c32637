use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A root known to the broker: a named dataset tree served by one publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootEntry {
    pub name: String,
    pub http: String,
}

/// Broker-internal registry binding, including liveness bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootBinding {
    pub name: String,
    pub http: String,
    pub last_seen: DateTime<Utc>,
}

impl RootBinding {
    pub fn entry(&self) -> RootEntry {
        RootEntry {
            name: self.name.clone(),
            http: self.http.clone(),
        }
    }
}

/// Body of `POST /api/register` on the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub root: String,
    pub endpoint: String,
}

/// Response of `POST /api/register`: the displaced endpoint, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub previous: Option<String>,
}

/// Response of `GET /api/locate/{root}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocateResponse {
    pub endpoint: String,
}

/// Root entry as reported by the subscriber, with subscription status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribedRoot {
    pub name: String,
    pub http: String,
    pub subscribed: bool,
}

/// Flavor of a dataset, derived from its file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    /// N-dimensional chunked container (`.b2nd`)
    B2nd,
    /// 1-D byte-addressable chunked stream (`.b2frame`)
    B2frame,
    /// Any other file, served as a single opaque chunk
    File,
}

impl DatasetKind {
    pub fn from_relpath(relpath: &str) -> Self {
        if relpath.ends_with(".b2nd") {
            Self::B2nd
        } else if relpath.ends_with(".b2frame") {
            Self::B2frame
        } else {
            Self::File
        }
    }

    /// Container datasets expose chunk structure; opaque files do not.
    pub fn is_container(self) -> bool {
        !matches!(self, Self::File)
    }
}

/// Variable-length user attributes attached to a container dataset.
pub type Vlmeta = BTreeMap<String, serde_json::Value>;

/// Dataset metadata returned by `GET /api/info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub etag: String,
    pub kind: DatasetKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_shape: Option<Vec<u64>>,
    pub chunk_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_sizes: Option<Vec<u64>>,
    #[serde(default)]
    pub vlmeta: Vlmeta,
}

impl DatasetMeta {
    /// Shape the slice algebra works over. Opaque files present as a 1-D
    /// byte array of the file size.
    pub fn effective_shape(&self) -> Vec<u64> {
        match &self.shape {
            Some(shape) => shape.clone(),
            None => vec![self.opaque_size()],
        }
    }

    pub fn effective_chunk_shape(&self) -> Vec<u64> {
        match &self.chunk_shape {
            Some(chunk_shape) => chunk_shape.clone(),
            None => vec![self.opaque_size().max(1)],
        }
    }

    pub fn effective_dtype(&self) -> String {
        self.dtype.clone().unwrap_or_else(|| "u1".to_owned())
    }

    fn opaque_size(&self) -> u64 {
        self.chunk_sizes
            .as_ref()
            .and_then(|sizes| sizes.first().copied())
            .unwrap_or(0)
    }
}

/// A coalesced batch of dataset changes under one root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub paths: Vec<String>,
}

/// Registry events fanned out on the broker bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    /// A publisher bound (or re-bound) a root.
    Registered { root: String, endpoint: String },
    /// A publisher was displaced by a later registration and must stop
    /// serving the root.
    Evicted { root: String, endpoint: String },
    /// A root binding was dropped.
    Unregistered { root: String },
}

/// Body of the MessagePack slice transport (the non-cframe encoding).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlicePayload {
    pub shape: Vec<u64>,
    pub dtype: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Value of the `X-Transport-Encoding` header on fetch responses.
pub const ENCODING_HEADER: &str = "x-transport-encoding";
pub const ENCODING_CFRAME: &str = "cframe";
pub const ENCODING_MSGPACK: &str = "msgpack";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_suffix() {
        assert_eq!(DatasetKind::from_relpath("a/b/ds.b2nd"), DatasetKind::B2nd);
        assert_eq!(DatasetKind::from_relpath("ds.b2frame"), DatasetKind::B2frame);
        assert_eq!(DatasetKind::from_relpath("README.md"), DatasetKind::File);
        assert!(!DatasetKind::File.is_container());
        assert!(DatasetKind::B2nd.is_container());
    }

    #[test]
    fn bus_event_wire_shape() {
        let ev = BusEvent::Evicted {
            root: "foo".into(),
            endpoint: "localhost:8001".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "evicted");
        assert_eq!(json["root"], "foo");
    }

    #[test]
    fn meta_omits_absent_container_fields() {
        let meta = DatasetMeta {
            etag: "1:2".into(),
            kind: DatasetKind::File,
            shape: None,
            dtype: None,
            chunk_shape: None,
            chunk_count: 1,
            chunk_sizes: Some(vec![42]),
            vlmeta: Vlmeta::new(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("shape").is_none());
        assert_eq!(json["kind"], "file");
        assert_eq!(json["chunk_sizes"][0], 42);
    }
}
