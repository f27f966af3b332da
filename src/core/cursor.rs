//! Opaque keyset cursors.
//!
//! A cursor carries the last-seen sort key of a page, not an offset, so rows
//! inserted or deleted elsewhere in the ordering never shift later pages.
//! Only a change exactly at the boundary key can make a page skip or repeat
//! that one row.
//!
//! Wire form: URL-safe base64 (no padding) of a small JSON envelope holding
//! the key, the direction and a truncated SHA-256 checksum bound to the
//! codec's namespace. Decoding checks the checksum and then the key shape;
//! any mismatch is `InvalidCursor`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::core::GatewayError;

const CURSOR_VERSION: u8 = 1;
const CHECKSUM_HEX_LEN: usize = 16;

/// One component of a sort key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum SortValue {
    /// Signed integer column.
    #[serde(rename = "i")]
    Int(i64),
    /// Text column.
    #[serde(rename = "s")]
    Str(String),
    /// Boolean column.
    #[serde(rename = "b")]
    Bool(bool),
    /// UUID column.
    #[serde(rename = "u")]
    Uuid(Uuid),
}

impl SortValue {
    /// Column type of this value.
    #[must_use]
    pub const fn kind(&self) -> SortKind {
        match self {
            Self::Int(_) => SortKind::Int,
            Self::Str(_) => SortKind::Str,
            Self::Bool(_) => SortKind::Bool,
            Self::Uuid(_) => SortKind::Uuid,
        }
    }
}

/// Column type expected at one position of a sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortKind {
    /// [`SortValue::Int`].
    Int,
    /// [`SortValue::Str`].
    Str,
    /// [`SortValue::Bool`].
    Bool,
    /// [`SortValue::Uuid`].
    Uuid,
}

/// Ordered tuple of sort values.
pub type SortKey = Vec<SortValue>;

/// Paging direction relative to the encoded key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    /// Rows strictly after the key.
    #[default]
    #[serde(rename = "f")]
    Forward,
    /// Rows strictly before the key.
    #[serde(rename = "b")]
    Backward,
}

/// Decoded cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    /// Last-seen sort key.
    pub key: SortKey,
    /// Paging direction.
    pub direction: Direction,
}

impl Cursor {
    /// Forward cursor after `key`.
    #[must_use]
    pub const fn after(key: SortKey) -> Self {
        Self {
            key,
            direction: Direction::Forward,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u8,
    d: Direction,
    k: SortKey,
    c: String,
}

/// Encodes and decodes cursors for one ordered listing.
///
/// The namespace (e.g. the table name) is folded into the checksum, so a
/// cursor minted for one listing is rejected by another.
#[derive(Debug, Clone)]
pub struct CursorCodec {
    namespace: String,
    shape: Vec<SortKind>,
}

impl CursorCodec {
    /// Codec for keys of the given shape.
    pub fn new(namespace: impl Into<String>, shape: impl Into<Vec<SortKind>>) -> Self {
        Self {
            namespace: namespace.into(),
            shape: shape.into(),
        }
    }

    /// Expected key shape.
    #[must_use]
    pub fn shape(&self) -> &[SortKind] {
        &self.shape
    }

    /// Encode a cursor.
    ///
    /// # Errors
    ///
    /// `InvalidCursor` if `cursor.key` does not match the codec's shape.
    pub fn encode(&self, cursor: &Cursor) -> Result<String, GatewayError> {
        self.check_shape(&cursor.key)?;
        let envelope = Envelope {
            v: CURSOR_VERSION,
            d: cursor.direction,
            c: self.checksum(cursor.direction, &cursor.key),
            k: cursor.key.clone(),
        };
        let json = serde_json::to_vec(&envelope).map_err(GatewayError::backend)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Encode a forward cursor after `key`.
    ///
    /// # Errors
    ///
    /// See [`encode`](Self::encode).
    pub fn encode_key(&self, key: &[SortValue]) -> Result<String, GatewayError> {
        self.encode(&Cursor::after(key.to_vec()))
    }

    /// Decode a cursor produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// `InvalidCursor` for malformed, tampered or wrongly shaped input.
    pub fn decode(&self, raw: &str) -> Result<Cursor, GatewayError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw.trim())
            .map_err(|_| GatewayError::InvalidCursor("not base64".into()))?;
        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|_| GatewayError::InvalidCursor("malformed payload".into()))?;
        if envelope.v != CURSOR_VERSION {
            return Err(GatewayError::InvalidCursor(format!(
                "unsupported version {}",
                envelope.v
            )));
        }
        if envelope.c != self.checksum(envelope.d, &envelope.k) {
            return Err(GatewayError::InvalidCursor("checksum mismatch".into()));
        }
        self.check_shape(&envelope.k)?;
        Ok(Cursor {
            key: envelope.k,
            direction: envelope.d,
        })
    }

    fn check_shape(&self, key: &[SortValue]) -> Result<(), GatewayError> {
        if key.len() != self.shape.len() {
            return Err(GatewayError::InvalidCursor(format!(
                "expected {} key columns, found {}",
                self.shape.len(),
                key.len()
            )));
        }
        for (idx, (value, kind)) in key.iter().zip(&self.shape).enumerate() {
            if value.kind() != *kind {
                return Err(GatewayError::InvalidCursor(format!(
                    "column {idx}: expected {kind:?}, found {:?}",
                    value.kind()
                )));
            }
        }
        Ok(())
    }

    fn checksum(&self, direction: Direction, key: &[SortValue]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.namespace.as_bytes());
        hasher.update([0u8, direction as u8]);
        // Serializing plain enums and strings cannot fail.
        hasher.update(serde_json::to_vec(key).unwrap_or_default());
        let mut hex = format!("{:x}", hasher.finalize());
        hex.truncate(CHECKSUM_HEX_LEN);
        hex
    }
}

/// One page of an ordered listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items in sort order.
    pub items: Vec<T>,
    /// Cursor for the following page, absent on the last page.
    pub next_cursor: Option<String>,
}

/// Source of rows ordered by a sort key, read strictly after a position.
pub trait KeysetSource {
    /// Shape of the sort key `table` is ordered by.
    fn key_shape(&self, table: &str) -> Vec<SortKind>;

    /// Up to `limit` rows of `table` ordered by key, strictly after `after`
    /// when given.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn scan_after(
        &mut self,
        table: &str,
        after: Option<&[SortValue]>,
        limit: usize,
    ) -> Result<Vec<(SortKey, Value)>, GatewayError>;
}

/// Read one forward page of `table` from `source`.
///
/// Fetches one extra row to learn whether another page exists, so the last
/// page never carries a dangling cursor.
///
/// # Errors
///
/// `InvalidCursor` for a bad cursor or a backward cursor; backend failures.
pub fn paginate<S: KeysetSource + ?Sized>(
    source: &mut S,
    codec: &CursorCodec,
    table: &str,
    cursor: Option<&str>,
    page_size: usize,
) -> Result<Page<Value>, GatewayError> {
    let page_size = page_size.max(1);
    let after = match cursor {
        Some(raw) => {
            let cursor = codec.decode(raw)?;
            if cursor.direction != Direction::Forward {
                return Err(GatewayError::InvalidCursor(
                    "backward paging is not supported for this listing".into(),
                ));
            }
            Some(cursor.key)
        }
        None => None,
    };
    let mut rows = source.scan_after(table, after.as_deref(), page_size + 1)?;
    let has_more = rows.len() > page_size;
    rows.truncate(page_size);
    let next_cursor = match (has_more, rows.last()) {
        (true, Some((key, _))) => Some(codec.encode_key(key)?),
        _ => None,
    };
    Ok(Page {
        items: rows.into_iter().map(|(_, value)| value).collect(),
        next_cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> CursorCodec {
        CursorCodec::new("orders", [SortKind::Int, SortKind::Str])
    }

    #[test]
    fn decode_inverts_encode() {
        let codec = codec();
        let key = vec![SortValue::Int(-42), SortValue::Str("a/b+c".into())];
        let raw = codec.encode_key(&key).unwrap();
        assert!(!raw.contains('='));
        assert_eq!(codec.decode(&raw).unwrap(), Cursor::after(key));
    }

    #[test]
    fn tampered_cursor_is_rejected() {
        let codec = codec();
        let raw = codec
            .encode_key(&[SortValue::Int(1), SortValue::Str("x".into())])
            .unwrap();
        let json = URL_SAFE_NO_PAD.decode(&raw).unwrap();
        let forged = String::from_utf8(json).unwrap().replace("\"x\"", "\"y\"");
        let forged = URL_SAFE_NO_PAD.encode(forged);
        assert!(matches!(codec.decode(&forged), Err(GatewayError::InvalidCursor(_))));

        let mut flipped = raw.into_bytes();
        flipped[3] ^= 0x01;
        let flipped = String::from_utf8_lossy(&flipped).into_owned();
        assert!(matches!(codec.decode(&flipped), Err(GatewayError::InvalidCursor(_))));
    }

    #[test]
    fn wrong_shape_is_rejected_not_coerced() {
        let codec = codec();
        let err = codec.encode_key(&[SortValue::Str("1".into()), SortValue::Str("x".into())]);
        assert!(matches!(err, Err(GatewayError::InvalidCursor(_))));

        let other = CursorCodec::new("orders", [SortKind::Str, SortKind::Str]);
        let raw = other
            .encode_key(&[SortValue::Str("1".into()), SortValue::Str("x".into())])
            .unwrap();
        assert!(matches!(codec.decode(&raw), Err(GatewayError::InvalidCursor(_))));
    }

    #[test]
    fn cursor_is_bound_to_namespace() {
        let key = [SortValue::Int(1), SortValue::Str("x".into())];
        let raw = codec().encode_key(&key).unwrap();
        let users = CursorCodec::new("users", [SortKind::Int, SortKind::Str]);
        assert!(users.decode(&raw).is_err());
    }

    #[test]
    fn garbage_never_panics() {
        let codec = codec();
        for raw in ["", "!!!", "e30", "bnVsbA", "eyJ2IjoxfQ"] {
            assert!(codec.decode(raw).is_err(), "{raw}");
        }
    }
}
