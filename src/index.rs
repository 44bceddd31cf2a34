use crate::clock::Timestamp;
use crate::error::TripleStoreError;
use crate::tuple::{AttrPart, Attribute, KeyElem, Value};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Attribute under which an entity's collection membership fact lives; the
/// fact that survives expiry as the tombstone.
pub const COLLECTION_ATTRIBUTE: &str = "_collection";

/// One versioned fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripleRow {
    pub id: CompactString,
    pub attribute: Attribute,
    pub value: Value,
    pub timestamp: Timestamp,
    pub expired: bool,
}

impl TripleRow {
    pub fn new(
        id: impl Into<CompactString>,
        attribute: Attribute,
        value: Value,
        timestamp: Timestamp,
        expired: bool,
    ) -> Self {
        Self {
            id: id.into(),
            attribute,
            value,
            timestamp,
            expired,
        }
    }
}

/// A metadata tuple. Values escape the scalar fact domain, so they are held
/// as JSON rather than `Value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataTuple {
    pub entity: CompactString,
    pub attribute: Vec<AttrPart>,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFamily {
    Eav,
    Ave,
    Vae,
    ClientTimestamp,
    Metadata,
}

impl IndexFamily {
    pub fn tag(self) -> &'static str {
        match self {
            IndexFamily::Eav => "EAV",
            IndexFamily::Ave => "AVE",
            IndexFamily::Vae => "VAE",
            IndexFamily::ClientTimestamp => "clientTimestamp",
            IndexFamily::Metadata => "metadata",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, TripleStoreError> {
        match tag {
            "EAV" => Ok(IndexFamily::Eav),
            "AVE" => Ok(IndexFamily::Ave),
            "VAE" => Ok(IndexFamily::Vae),
            "clientTimestamp" => Ok(IndexFamily::ClientTimestamp),
            "metadata" => Ok(IndexFamily::Metadata),
            other => Err(TripleStoreError::IndexNotFound(other.to_string())),
        }
    }

    pub fn key_elem(self) -> KeyElem {
        KeyElem::Text(self.tag().into())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FactMeta {
    expired: bool,
}

pub(crate) fn encode_meta(expired: bool) -> Result<Arc<[u8]>, TripleStoreError> {
    let bytes = rmp_serde::to_vec(&FactMeta { expired })
        .map_err(|e| TripleStoreError::Encode(e.to_string()))?;
    Ok(Arc::from(bytes.as_slice()))
}

pub(crate) fn decode_meta(bytes: &[u8]) -> Result<bool, TripleStoreError> {
    let meta: FactMeta =
        rmp_serde::from_slice(bytes).map_err(|e| TripleStoreError::Decode(e.to_string()))?;
    Ok(meta.expired)
}

pub(crate) fn timestamp_elem(timestamp: &Timestamp) -> KeyElem {
    KeyElem::Array(vec![
        KeyElem::Number(timestamp.counter as f64),
        KeyElem::Text(timestamp.client_id.clone()),
    ])
}

pub(crate) fn eav_key(row: &TripleRow) -> Vec<KeyElem> {
    vec![
        IndexFamily::Eav.key_elem(),
        KeyElem::Text(row.id.clone()),
        KeyElem::from(&row.attribute),
        KeyElem::from(&row.value),
        timestamp_elem(&row.timestamp),
    ]
}

pub(crate) fn ave_key(row: &TripleRow) -> Vec<KeyElem> {
    vec![
        IndexFamily::Ave.key_elem(),
        KeyElem::from(&row.attribute),
        KeyElem::from(&row.value),
        KeyElem::Text(row.id.clone()),
        timestamp_elem(&row.timestamp),
    ]
}

pub(crate) fn vae_key(row: &TripleRow) -> Vec<KeyElem> {
    vec![
        IndexFamily::Vae.key_elem(),
        KeyElem::from(&row.value),
        KeyElem::from(&row.attribute),
        KeyElem::Text(row.id.clone()),
        timestamp_elem(&row.timestamp),
    ]
}

pub(crate) fn client_timestamp_key(row: &TripleRow) -> Vec<KeyElem> {
    vec![
        IndexFamily::ClientTimestamp.key_elem(),
        KeyElem::Text(row.timestamp.client_id.clone()),
        timestamp_elem(&row.timestamp),
        KeyElem::Text(row.id.clone()),
        KeyElem::from(&row.attribute),
        KeyElem::from(&row.value),
    ]
}

/// All fact index keys for one row, maintained in lockstep.
pub(crate) fn index_keys(row: &TripleRow) -> [Vec<KeyElem>; 4] {
    [
        eav_key(row),
        ave_key(row),
        vae_key(row),
        client_timestamp_key(row),
    ]
}

pub(crate) fn metadata_key(entity: &str, attribute: &[AttrPart]) -> Vec<KeyElem> {
    let mut key = vec![IndexFamily::Metadata.key_elem(), KeyElem::Text(entity.into())];
    key.extend(attribute.iter().map(KeyElem::from));
    key
}

pub(crate) fn encode_metadata_value(
    value: &serde_json::Value,
) -> Result<Arc<[u8]>, TripleStoreError> {
    let bytes = serde_json::to_vec(value).map_err(|e| TripleStoreError::Encode(e.to_string()))?;
    Ok(Arc::from(bytes.as_slice()))
}

pub(crate) fn decode_metadata_value(bytes: &[u8]) -> Result<serde_json::Value, TripleStoreError> {
    serde_json::from_slice(bytes).map_err(|e| TripleStoreError::Decode(e.to_string()))
}

fn parse_text(elem: &KeyElem, what: &str) -> Result<CompactString, TripleStoreError> {
    match elem {
        KeyElem::Text(s) => Ok(s.clone()),
        other => Err(TripleStoreError::Decode(format!(
            "expected text {what}, found {other:?}"
        ))),
    }
}

fn parse_value(elem: &KeyElem) -> Result<Value, TripleStoreError> {
    match elem {
        KeyElem::Null => Ok(Value::Null),
        KeyElem::Boolean(b) => Ok(Value::Boolean(*b)),
        KeyElem::Number(n) => Ok(Value::Number(*n)),
        KeyElem::Text(s) => Ok(Value::Text(s.clone())),
        other => Err(TripleStoreError::Decode(format!(
            "expected scalar value, found {other:?}"
        ))),
    }
}

fn parse_attr_part(elem: &KeyElem) -> Result<AttrPart, TripleStoreError> {
    match elem {
        KeyElem::Number(n) => Ok(AttrPart::Number(*n)),
        KeyElem::Text(s) => Ok(AttrPart::Text(s.clone())),
        other => Err(TripleStoreError::Decode(format!(
            "expected attribute component, found {other:?}"
        ))),
    }
}

fn parse_attribute(elem: &KeyElem) -> Result<Attribute, TripleStoreError> {
    match elem {
        KeyElem::Array(parts) => parts
            .iter()
            .map(parse_attr_part)
            .collect::<Result<Vec<_>, _>>()
            .map(Attribute::new),
        other => Err(TripleStoreError::Decode(format!(
            "expected attribute array, found {other:?}"
        ))),
    }
}

fn parse_timestamp(elem: &KeyElem) -> Result<Timestamp, TripleStoreError> {
    let KeyElem::Array(parts) = elem else {
        return Err(TripleStoreError::Decode(format!(
            "expected timestamp array, found {elem:?}"
        )));
    };
    match parts.as_slice() {
        [KeyElem::Number(counter), KeyElem::Text(client_id)] if *counter >= 0.0 => {
            Ok(Timestamp::new(*counter as u64, client_id.clone()))
        }
        _ => Err(TripleStoreError::Decode(format!(
            "malformed timestamp component: {parts:?}"
        ))),
    }
}

/// Decodes a fact index tuple back into a row, dispatching on the family tag.
/// `expired` comes from the stored value (fabricated as `false` for deletes,
/// where the erased value is unavailable).
pub(crate) fn decode_fact(tuple: &[KeyElem], expired: bool) -> Result<TripleRow, TripleStoreError> {
    let tag = tuple
        .first()
        .ok_or_else(|| TripleStoreError::Decode("empty index key".into()))?;
    let family = IndexFamily::from_tag(&parse_text(tag, "index family tag")?)?;
    let (id, attribute, value, timestamp) = match (family, &tuple[1..]) {
        (IndexFamily::Eav, [e, a, v, t]) => {
            (parse_text(e, "entity id")?, a, v, parse_timestamp(t)?)
        }
        (IndexFamily::Ave, [a, v, e, t]) => {
            (parse_text(e, "entity id")?, a, v, parse_timestamp(t)?)
        }
        (IndexFamily::Vae, [v, a, e, t]) => {
            (parse_text(e, "entity id")?, a, v, parse_timestamp(t)?)
        }
        (IndexFamily::ClientTimestamp, [_client, t, e, a, v]) => {
            (parse_text(e, "entity id")?, a, v, parse_timestamp(t)?)
        }
        (family, _) => {
            return Err(TripleStoreError::Decode(format!(
                "malformed {} index key of {} components",
                family.tag(),
                tuple.len()
            )))
        }
    };
    Ok(TripleRow {
        id,
        attribute: parse_attribute(attribute)?,
        value: parse_value(value)?,
        timestamp,
        expired,
    })
}

/// Decodes fact-index scan results, reading `expired` from each stored value.
pub(crate) fn decode_scan(
    rows: Vec<(Vec<KeyElem>, Arc<[u8]>)>,
) -> Result<Vec<TripleRow>, TripleStoreError> {
    rows.into_iter()
        .map(|(tuple, blob)| decode_fact(&tuple, decode_meta(&blob)?))
        .collect()
}

pub(crate) fn decode_metadata_scan(
    rows: Vec<(Vec<KeyElem>, Arc<[u8]>)>,
) -> Result<Vec<MetadataTuple>, TripleStoreError> {
    rows.into_iter()
        .map(|(tuple, blob)| {
            let [_tag, entity, attr_parts @ ..] = tuple.as_slice() else {
                return Err(TripleStoreError::Decode("malformed metadata key".into()));
            };
            Ok(MetadataTuple {
                entity: parse_text(entity, "entity id")?,
                attribute: attr_parts
                    .iter()
                    .map(parse_attr_part)
                    .collect::<Result<Vec<_>, _>>()?,
                value: decode_metadata_value(&blob)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{
        ave_key, client_timestamp_key, decode_fact, decode_meta, eav_key, encode_meta,
        vae_key, IndexFamily, TripleRow,
    };
    use crate::clock::Timestamp;
    use crate::error::TripleStoreErrorCode;
    use crate::tuple::{Attribute, Value};

    fn row() -> TripleRow {
        TripleRow::new(
            "e1",
            Attribute::from(vec!["users", "name"]),
            Value::Text("Ada".into()),
            Timestamp::new(1, "c1"),
            false,
        )
    }

    #[test]
    fn every_fact_family_round_trips() {
        let row = row();
        for key in [
            eav_key(&row),
            ave_key(&row),
            vae_key(&row),
            client_timestamp_key(&row),
        ] {
            let decoded = decode_fact(&key, row.expired).expect("decode");
            assert_eq!(decoded, row);
        }
    }

    #[test]
    fn expired_flag_round_trips_through_meta_blob() {
        for expired in [false, true] {
            let blob = encode_meta(expired).expect("encode");
            assert_eq!(decode_meta(&blob).expect("decode"), expired);
        }
    }

    #[test]
    fn unknown_family_tag_fails_with_index_not_found() {
        let mut key = eav_key(&row());
        key[0] = crate::tuple::KeyElem::Text("EVA".into());
        let err = decode_fact(&key, false).expect_err("unknown family");
        assert_eq!(err.code(), TripleStoreErrorCode::IndexNotFound);
    }

    #[test]
    fn family_tags_parse_back() {
        for family in [
            IndexFamily::Eav,
            IndexFamily::Ave,
            IndexFamily::Vae,
            IndexFamily::ClientTimestamp,
            IndexFamily::Metadata,
        ] {
            assert_eq!(IndexFamily::from_tag(family.tag()).unwrap(), family);
        }
    }
}
