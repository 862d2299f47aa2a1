//! Record <-> key-value mapping
//!
//! A record type declares a static table of fields, each with the key suffix it
//! is stored under and a codec for its value. Encoding emits one pair per
//! present field; decoding walks a key-sorted slice of pairs with a cursor.
//!
//! Decoding a map of records (`decode_map`) requires the input to be sorted
//! ascending by key: every record's pairs must form one contiguous run. The
//! backends in [`crate::kv`] always return prefix reads in that order.

use crate::kv::KeyValue;
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Value codec for a single stored field
///
/// Only types implementing this trait can appear in a schema table, so an
/// unsupported field kind is rejected when the table is compiled.
pub trait FieldCodec: Sized {
    fn encode(&self) -> Vec<u8>;
    fn decode(raw: &[u8]) -> std::result::Result<Self, String>;
}

impl FieldCodec for String {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode(raw: &[u8]) -> std::result::Result<Self, String> {
        String::from_utf8(raw.to_vec()).map_err(|e| e.to_string())
    }
}

impl FieldCodec for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        self.clone()
    }

    fn decode(raw: &[u8]) -> std::result::Result<Self, String> {
        Ok(raw.to_vec())
    }
}

macro_rules! decimal_codec {
    ($($int:ty),*) => {
        $(
            impl FieldCodec for $int {
                fn encode(&self) -> Vec<u8> {
                    self.to_string().into_bytes()
                }

                fn decode(raw: &[u8]) -> std::result::Result<Self, String> {
                    let text = std::str::from_utf8(raw).map_err(|e| e.to_string())?;
                    text.parse::<$int>()
                        .map_err(|e| format!("{:?} is not a valid {}: {}", text, stringify!($int), e))
                }
            }
        )*
    };
}

decimal_codec!(u8, u16, u32, u64, i8, i16, i32, i64);

/// One row of a record's schema table
pub struct Field<R> {
    /// Key suffix below the record prefix
    pub suffix: &'static str,
    /// Encoded value, `None` when the field is absent
    pub encode: fn(&R) -> Option<Vec<u8>>,
    /// Parse `raw` and mark the field present
    pub decode: fn(&mut R, &[u8]) -> std::result::Result<(), String>,
}

/// A record with a static key-value schema
pub trait KvRecord: Default + 'static {
    const FIELDS: &'static [Field<Self>];

    fn field(suffix: &str) -> Option<&'static Field<Self>> {
        Self::FIELDS.iter().find(|f| f.suffix == suffix)
    }
}

/// Build a schema table from `field => "suffix"` rows.
///
/// Every listed field must be an `Option<T>` with `T: FieldCodec`.
#[macro_export]
macro_rules! kv_fields {
    ($record:ty { $($field:ident => $suffix:literal),* $(,)? }) => {
        &[$(
            {
                fn encode(r: &$record) -> Option<Vec<u8>> {
                    r.$field.as_ref().map(|v| $crate::mapper::FieldCodec::encode(v))
                }
                fn decode(r: &mut $record, raw: &[u8]) -> std::result::Result<(), String> {
                    r.$field = Some($crate::mapper::FieldCodec::decode(raw)?);
                    Ok(())
                }
                $crate::mapper::Field {
                    suffix: $suffix,
                    encode,
                    decode,
                }
            }
        ),*]
    };
}

/// Forward-only cursor over key-sorted pairs
pub struct SortedCursor<'a> {
    pairs: &'a [KeyValue],
    pos: usize,
}

impl<'a> SortedCursor<'a> {
    pub fn new(pairs: &'a [KeyValue]) -> Self {
        Self { pairs, pos: 0 }
    }

    pub fn peek(&self) -> Option<&'a KeyValue> {
        self.pairs.get(self.pos)
    }

    pub fn advance(&mut self) {
        self.pos += 1;
    }
}

/// Encode the present fields of `record` under `prefix`, ascending by key
pub fn encode_record<R: KvRecord>(record: &R, prefix: &str) -> Vec<KeyValue> {
    let mut pairs: Vec<KeyValue> = R::FIELDS
        .iter()
        .filter_map(|field| {
            (field.encode)(record).map(|value| KeyValue::new(format!("{prefix}{}", field.suffix), value))
        })
        .collect();
    pairs.sort_by(|a, b| a.key.cmp(&b.key));
    pairs
}

/// Decode the pairs under `prefix` into a fresh record.
///
/// Returns the record and the number of fields that were applied.
pub fn decode_record<R: KvRecord>(pairs: &[KeyValue], prefix: &str) -> Result<(R, usize)> {
    let mut cursor = SortedCursor::new(pairs);
    let mut record = R::default();
    let applied = decode_into(&mut cursor, prefix, &mut record)?;
    Ok((record, applied))
}

/// Decode one record per key segment below `prefix`.
///
/// Input must be sorted ascending by key. Keys directly below `prefix` without
/// a further `/` are skipped; decoding stops at the first key outside `prefix`.
pub fn decode_map<R: KvRecord>(
    pairs: &[KeyValue],
    prefix: &str,
) -> Result<(BTreeMap<String, R>, usize)> {
    let mut cursor = SortedCursor::new(pairs);
    let mut records = BTreeMap::new();
    let mut applied = 0;

    while let Some(kv) = cursor.peek() {
        let Some(rest) = kv.key.strip_prefix(prefix) else {
            break;
        };
        let Some((segment, _)) = rest.split_once('/') else {
            cursor.advance();
            continue;
        };

        let segment = segment.to_string();
        let sub_prefix = format!("{prefix}{segment}/");
        let mut record = R::default();
        applied += decode_into(&mut cursor, &sub_prefix, &mut record)?;
        records.insert(segment, record);
    }

    Ok((records, applied))
}

/// Consume the contiguous run of pairs under `prefix` into `record`
fn decode_into<R: KvRecord>(
    cursor: &mut SortedCursor<'_>,
    prefix: &str,
    record: &mut R,
) -> Result<usize> {
    let mut applied = 0;

    while let Some(kv) = cursor.peek() {
        let Some(suffix) = kv.key.strip_prefix(prefix) else {
            break;
        };
        if let Some(field) = R::field(suffix) {
            (field.decode)(record, &kv.value).map_err(|reason| Error::malformed(&kv.key, reason))?;
            applied += 1;
        }
        cursor.advance();
    }

    Ok(applied)
}
