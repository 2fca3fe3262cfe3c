//! Persisted state: per-node [`Snapshot`]s and the recursive [`TreeSnapshot`].
//!
//! # Wire Format
//!
//! All integers are big-endian `u32`. A length of zero for the root bytes
//! means "no persisted state", so the node re-derives its state from props.
//!
//! ```text
//! TreeSnapshot := len root_bytes
//!                 count
//!                 count × { len NodeKey, len TreeSnapshot }
//! NodeKey      := len workflow_name_utf8, len render_key_utf8
//! ```
//!
//! This is the only durable artifact the runtime defines.

use std::collections::HashMap;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::identity::NodeKey;

/// Errors from decoding persisted state.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The input ended before a complete field could be read.
    #[error("snapshot truncated while reading {field}: needed {needed} bytes, {remaining} left")]
    Truncated {
        /// The field being read.
        field: &'static str,
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        remaining: usize,
    },

    /// A string field was not valid UTF-8.
    #[error("snapshot field {field} is not valid utf-8")]
    InvalidUtf8 {
        /// The field being read.
        field: &'static str,
    },

    /// Bytes were left over after a complete record.
    #[error("snapshot has {remaining} trailing bytes")]
    TrailingBytes {
        /// Unconsumed byte count.
        remaining: usize,
    },

    /// A JSON payload could not be decoded.
    #[error("snapshot payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Opaque persisted state of a single node.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Snapshot {
    bytes: Bytes,
}

impl Snapshot {
    /// Wrap raw bytes.
    pub fn of(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Persist a string.
    pub fn of_str(value: &str) -> Self {
        Self::of(Bytes::copy_from_slice(value.as_bytes()))
    }

    /// Persist an `i32` as four big-endian bytes.
    pub fn of_i32(value: i32) -> Self {
        Self::of(Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    /// Persist any serializable value as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, SnapshotError> {
        Ok(Self::of(serde_json::to_vec(value)?))
    }

    /// The raw bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Number of persisted bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether no bytes were persisted.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read the bytes back as a string.
    pub fn to_str(&self) -> Result<&str, SnapshotError> {
        std::str::from_utf8(&self.bytes).map_err(|_| SnapshotError::InvalidUtf8 { field: "state" })
    }

    /// Read the bytes back as an `i32` written by [`Snapshot::of_i32`].
    pub fn to_i32(&self) -> Result<i32, SnapshotError> {
        let raw: [u8; 4] = self
            .bytes
            .as_ref()
            .try_into()
            .map_err(|_| SnapshotError::Truncated {
                field: "i32 state",
                needed: 4,
                remaining: self.bytes.len(),
            })?;
        Ok(i32::from_be_bytes(raw))
    }

    /// Decode a JSON payload written by [`Snapshot::json`].
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, SnapshotError> {
        Ok(serde_json::from_slice(&self.bytes)?)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Snapshot({} bytes)", self.bytes.len())
    }
}

/// Recursive persisted state of a subtree.
///
/// Mirrors the node tree: the root's own [`Snapshot`] plus one entry per
/// child, keyed by the child's [`NodeKey`]. Child order follows render order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TreeSnapshot {
    root: Option<Snapshot>,
    children: Vec<(NodeKey, TreeSnapshot)>,
}

impl TreeSnapshot {
    /// Assemble a tree snapshot.
    ///
    /// An empty root snapshot is normalized to `None`; the two are
    /// indistinguishable once encoded.
    pub fn new(root: Option<Snapshot>, children: Vec<(NodeKey, TreeSnapshot)>) -> Self {
        Self {
            root: root.filter(|snapshot| !snapshot.is_empty()),
            children,
        }
    }

    /// A snapshot holding only root state.
    pub fn for_root_only(root: Option<Snapshot>) -> Self {
        Self::new(root, Vec::new())
    }

    /// The root node's persisted state.
    pub fn root(&self) -> Option<&Snapshot> {
        self.root.as_ref()
    }

    /// Persisted children, in render order.
    pub fn children(&self) -> &[(NodeKey, TreeSnapshot)] {
        &self.children
    }

    /// Find a child snapshot by key.
    pub fn child(&self, key: &NodeKey) -> Option<&TreeSnapshot> {
        self.children
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, snapshot)| snapshot)
    }

    pub(crate) fn into_parts(self) -> (Option<Snapshot>, HashMap<NodeKey, TreeSnapshot>) {
        (self.root, self.children.into_iter().collect())
    }

    /// Encode to the wire format.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf);
        buf.freeze()
    }

    fn write_to(&self, buf: &mut BytesMut) {
        let root: &[u8] = match &self.root {
            Some(snapshot) => snapshot.bytes(),
            None => &[],
        };
        put_len_prefixed(buf, root);
        buf.put_u32(self.children.len() as u32);
        for (key, child) in &self.children {
            let mut key_buf = BytesMut::new();
            put_len_prefixed(&mut key_buf, key.workflow.as_bytes());
            put_len_prefixed(&mut key_buf, key.key.as_bytes());
            put_len_prefixed(buf, &key_buf);

            let mut child_buf = BytesMut::new();
            child.write_to(&mut child_buf);
            put_len_prefixed(buf, &child_buf);
        }
    }

    /// Decode the wire format.
    pub fn parse(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let mut input = bytes;
        let snapshot = Self::read_from(&mut input)?;
        if !input.is_empty() {
            return Err(SnapshotError::TrailingBytes {
                remaining: input.len(),
            });
        }
        Ok(snapshot)
    }

    fn read_from(input: &mut &[u8]) -> Result<Self, SnapshotError> {
        let root = take_len_prefixed(input, "root state")?;
        let count = take_u32(input, "child count")? as usize;

        // Each child needs at least two length words; don't trust `count`
        // for the allocation.
        let mut children = Vec::with_capacity(count.min(input.len() / 8));
        for _ in 0..count {
            let mut key_bytes = take_len_prefixed(input, "child key")?;
            let workflow = take_string(&mut key_bytes, "child workflow name")?;
            let key = take_string(&mut key_bytes, "child render key")?;
            if !key_bytes.is_empty() {
                return Err(SnapshotError::TrailingBytes {
                    remaining: key_bytes.len(),
                });
            }

            let child = Self::parse(take_len_prefixed(input, "child snapshot")?)?;
            children.push((NodeKey { workflow, key }, child));
        }

        let root = (!root.is_empty()).then(|| Snapshot::of(Bytes::copy_from_slice(root)));
        Ok(Self { root, children })
    }
}

fn put_len_prefixed(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn take_u32(input: &mut &[u8], field: &'static str) -> Result<u32, SnapshotError> {
    if input.remaining() < 4 {
        return Err(SnapshotError::Truncated {
            field,
            needed: 4,
            remaining: input.remaining(),
        });
    }
    Ok(input.get_u32())
}

fn take_len_prefixed<'a>(input: &mut &'a [u8], field: &'static str) -> Result<&'a [u8], SnapshotError> {
    let len = take_u32(input, field)? as usize;
    if input.len() < len {
        return Err(SnapshotError::Truncated {
            field,
            needed: len,
            remaining: input.len(),
        });
    }
    let (head, tail) = input.split_at(len);
    *input = tail;
    Ok(head)
}

fn take_string(input: &mut &[u8], field: &'static str) -> Result<String, SnapshotError> {
    let raw = take_len_prefixed(input, field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| SnapshotError::InvalidUtf8 { field })
}
