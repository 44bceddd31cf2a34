use crate::clock::Timestamp;
use crate::error::TripleStoreError;
use crate::index::{
    decode_fact, decode_metadata_scan, decode_scan, metadata_key, timestamp_elem, IndexFamily,
    MetadataTuple, TripleRow, COLLECTION_ATTRIBUTE,
};
use crate::storage::ScanArgs;
use crate::tuple::{AttrPart, Attribute, KeyElem, Value};
use compact_str::CompactString;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

/// Comparison operator for client-timestamp index scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl TimestampOp {
    pub fn as_str(self) -> &'static str {
        match self {
            TimestampOp::Lt => "lt",
            TimestampOp::Lte => "lte",
            TimestampOp::Gt => "gt",
            TimestampOp::Gte => "gte",
            TimestampOp::Eq => "eq",
        }
    }
}

impl FromStr for TimestampOp {
    type Err = TripleStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lt" => Ok(TimestampOp::Lt),
            "lte" => Ok(TimestampOp::Lte),
            "gt" => Ok(TimestampOp::Gt),
            "gte" => Ok(TimestampOp::Gte),
            "eq" => Ok(TimestampOp::Eq),
            other => Err(TripleStoreError::InvalidTimestampScanOp(other.to_string())),
        }
    }
}

/// Position in the AVE ordering of one attribute: a value, optionally
/// narrowed to an entity id.
#[derive(Debug, Clone)]
pub struct ValueCursor {
    pub value: Value,
    pub entity_id: Option<CompactString>,
}

impl ValueCursor {
    pub fn at(value: Value) -> Self {
        Self {
            value,
            entity_id: None,
        }
    }

    pub fn at_entity(value: Value, entity_id: impl Into<CompactString>) -> Self {
        Self {
            value,
            entity_id: Some(entity_id.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValueRange {
    pub greater_than: Option<ValueCursor>,
    pub less_than: Option<ValueCursor>,
    pub order: Order,
}

fn entity_elem(entity: &str) -> KeyElem {
    KeyElem::Text(entity.into())
}

fn or_min(elem: Option<KeyElem>) -> KeyElem {
    elem.unwrap_or(KeyElem::Min)
}

fn or_max(elem: Option<KeyElem>) -> KeyElem {
    elem.unwrap_or(KeyElem::Max)
}

/// The attribute array capped with `Max`, so every extension of the path
/// (and the path itself) falls below it.
fn attr_capped(attribute: Option<&Attribute>) -> KeyElem {
    match attribute {
        Some(attribute) => {
            let mut parts: Vec<KeyElem> = attribute.parts().iter().map(KeyElem::from).collect();
            parts.push(KeyElem::Max);
            KeyElem::Array(parts)
        }
        None => KeyElem::Max,
    }
}

pub(crate) fn collection_scan(collection: &str, order: Order) -> ScanArgs {
    ScanArgs::with_prefix(vec![IndexFamily::Ave.key_elem()])
        .gte(vec![KeyElem::Array(vec![KeyElem::Text(collection.into())])])
        .lt(vec![KeyElem::Array(vec![
            KeyElem::Text(collection.into()),
            KeyElem::Max,
        ])])
        .reverse(order == Order::Desc)
}

pub(crate) fn eav_scan(
    entity: Option<&str>,
    attribute: Option<&Attribute>,
    value: Option<&Value>,
    order: Order,
) -> ScanArgs {
    let e = entity.map(entity_elem);
    let a = attribute.map(KeyElem::from);
    let v = value.map(KeyElem::from);
    ScanArgs::with_prefix(vec![IndexFamily::Eav.key_elem()])
        .gte(vec![
            or_min(e.clone()),
            or_min(a),
            or_min(v),
        ])
        .lt(vec![or_max(e), attr_capped(attribute), KeyElem::Max])
        .reverse(order == Order::Desc)
}

pub(crate) fn ave_scan(
    attribute: Option<&Attribute>,
    value: Option<&Value>,
    entity: Option<&str>,
    order: Order,
) -> ScanArgs {
    let a = attribute.map(KeyElem::from);
    let v = value.map(KeyElem::from);
    let e = entity.map(entity_elem);
    let attr_upper = if value.is_none() {
        attr_capped(attribute)
    } else {
        or_max(a.clone())
    };
    ScanArgs::with_prefix(vec![IndexFamily::Ave.key_elem()])
        .gte(vec![or_min(a), or_min(v.clone()), or_min(e)])
        .lt(vec![attr_upper, or_max(v), KeyElem::Max])
        .reverse(order == Order::Desc)
}

pub(crate) fn vae_scan(
    value: Option<&Value>,
    attribute: Option<&Attribute>,
    entity: Option<&str>,
    order: Order,
) -> ScanArgs {
    let v = value.map(KeyElem::from);
    let a = attribute.map(KeyElem::from);
    let e = entity.map(entity_elem);
    let attr_upper = if entity.is_none() {
        attr_capped(attribute)
    } else {
        or_max(a.clone())
    };
    ScanArgs::with_prefix(vec![IndexFamily::Vae.key_elem()])
        .gte(vec![or_min(v.clone()), or_min(a), or_min(e)])
        .lt(vec![or_max(v), attr_upper, KeyElem::Max])
        .reverse(order == Order::Desc)
}

pub(crate) fn values_in_range_scan(attribute: &Attribute, range: &ValueRange) -> ScanArgs {
    let mut args = ScanArgs::with_prefix(vec![
        IndexFamily::Ave.key_elem(),
        KeyElem::from(attribute),
    ])
    .reverse(range.order == Order::Desc);
    if let Some(cursor) = &range.greater_than {
        args = args.gt(vec![
            KeyElem::from(&cursor.value),
            or_max(cursor.entity_id.as_deref().map(entity_elem)),
            KeyElem::Max,
        ]);
    }
    if let Some(cursor) = &range.less_than {
        args = args.lt(vec![
            KeyElem::from(&cursor.value),
            or_min(cursor.entity_id.as_deref().map(entity_elem)),
            KeyElem::Min,
        ]);
    }
    args
}

/// Timestamp tuple capped with `Max`: above every key carrying exactly this
/// timestamp, below the next timestamp.
fn timestamp_capped(timestamp: &Timestamp) -> KeyElem {
    KeyElem::Array(vec![
        KeyElem::Number(timestamp.counter as f64),
        KeyElem::Text(timestamp.client_id.clone()),
        KeyElem::Max,
    ])
}

/// Timestamp tuple floored with `Min`: above every key carrying exactly this
/// timestamp's prefix, below all of its successors' keys. With no timestamp,
/// a bound below every concrete timestamp.
fn timestamp_floored(timestamp: Option<&Timestamp>) -> KeyElem {
    match timestamp {
        Some(timestamp) => KeyElem::Array(vec![
            KeyElem::Number(timestamp.counter as f64),
            KeyElem::Text(timestamp.client_id.clone()),
            KeyElem::Min,
        ]),
        None => KeyElem::Array(vec![KeyElem::Min]),
    }
}

pub(crate) fn client_timestamp_scan(
    client_id: &str,
    op: TimestampOp,
    timestamp: Option<&Timestamp>,
) -> Result<ScanArgs, TripleStoreError> {
    let args = ScanArgs::with_prefix(vec![
        IndexFamily::ClientTimestamp.key_elem(),
        KeyElem::Text(client_id.into()),
    ]);
    let args = match (op, timestamp) {
        (TimestampOp::Lt, Some(t)) => args.lt(vec![timestamp_elem(t)]),
        (TimestampOp::Lt, None) => args,
        (TimestampOp::Lte, Some(t)) => args.lte(vec![timestamp_capped(t)]),
        (TimestampOp::Lte, None) => args,
        (TimestampOp::Gt, t) => args.gt(vec![timestamp_floored(t)]),
        (TimestampOp::Gte, Some(t)) => args.gte(vec![timestamp_elem(t)]),
        (TimestampOp::Gte, None) => args.gte(vec![KeyElem::Array(Vec::new())]),
        (TimestampOp::Eq, Some(t)) => {
            args.gte(vec![timestamp_elem(t)]).lt(vec![timestamp_capped(t)])
        }
        (TimestampOp::Eq, None) => {
            return Err(TripleStoreError::InvalidTimestampScanOp(
                "eq without a timestamp".into(),
            ))
        }
    };
    Ok(args)
}

pub(crate) fn max_timestamp_scan(client_id: &str) -> ScanArgs {
    ScanArgs::with_prefix(vec![
        IndexFamily::ClientTimestamp.key_elem(),
        KeyElem::Text(client_id.into()),
    ])
    .reverse(true)
}

pub(crate) fn metadata_scan(entity: &str, attribute_prefix: &[AttrPart]) -> ScanArgs {
    ScanArgs::with_prefix(metadata_key(entity, attribute_prefix))
}

/// A source of ordered tuple scans: the committed multi-store view or a
/// transaction's staged view.
pub(crate) trait TupleScanner {
    fn scan_tuples(
        &self,
        args: &ScanArgs,
    ) -> Result<Vec<(Vec<KeyElem>, Arc<[u8]>)>, TripleStoreError>;
}

pub(crate) fn find_by_collection<S: TupleScanner + ?Sized>(
    scanner: &S,
    collection: &str,
    order: Order,
) -> Result<Vec<TripleRow>, TripleStoreError> {
    decode_scan(scanner.scan_tuples(&collection_scan(collection, order))?)
}

pub(crate) fn find_by_eav<S: TupleScanner + ?Sized>(
    scanner: &S,
    entity: Option<&str>,
    attribute: Option<&Attribute>,
    value: Option<&Value>,
    order: Order,
) -> Result<Vec<TripleRow>, TripleStoreError> {
    decode_scan(scanner.scan_tuples(&eav_scan(entity, attribute, value, order))?)
}

pub(crate) fn find_by_ave<S: TupleScanner + ?Sized>(
    scanner: &S,
    attribute: Option<&Attribute>,
    value: Option<&Value>,
    entity: Option<&str>,
    order: Order,
) -> Result<Vec<TripleRow>, TripleStoreError> {
    decode_scan(scanner.scan_tuples(&ave_scan(attribute, value, entity, order))?)
}

pub(crate) fn find_by_vae<S: TupleScanner + ?Sized>(
    scanner: &S,
    value: Option<&Value>,
    attribute: Option<&Attribute>,
    entity: Option<&str>,
    order: Order,
) -> Result<Vec<TripleRow>, TripleStoreError> {
    decode_scan(scanner.scan_tuples(&vae_scan(value, attribute, entity, order))?)
}

pub(crate) fn find_values_in_range<S: TupleScanner + ?Sized>(
    scanner: &S,
    attribute: &Attribute,
    range: &ValueRange,
) -> Result<Vec<TripleRow>, TripleStoreError> {
    decode_scan(scanner.scan_tuples(&values_in_range_scan(attribute, range))?)
}

pub(crate) fn find_by_client_timestamp<S: TupleScanner + ?Sized>(
    scanner: &S,
    client_id: &str,
    op: TimestampOp,
    timestamp: Option<&Timestamp>,
) -> Result<Vec<TripleRow>, TripleStoreError> {
    decode_scan(scanner.scan_tuples(&client_timestamp_scan(client_id, op, timestamp)?)?)
}

pub(crate) fn find_max_timestamp<S: TupleScanner + ?Sized>(
    scanner: &S,
    client_id: &str,
) -> Result<Option<Timestamp>, TripleStoreError> {
    let rows = scanner.scan_tuples(&max_timestamp_scan(client_id))?;
    match rows.into_iter().next() {
        Some((tuple, blob)) => {
            let row = decode_fact(&tuple, crate::index::decode_meta(&blob)?)?;
            Ok(Some(row.timestamp))
        }
        None => Ok(None),
    }
}

pub(crate) fn read_metadata_tuples<S: TupleScanner + ?Sized>(
    scanner: &S,
    entity: &str,
    attribute_prefix: &[AttrPart],
) -> Result<Vec<MetadataTuple>, TripleStoreError> {
    decode_metadata_scan(scanner.scan_tuples(&metadata_scan(entity, attribute_prefix))?)
}

/// True when the only facts left for the entity are expired `_collection`
/// tombstones.
pub(crate) fn is_entity_expired<S: TupleScanner + ?Sized>(
    scanner: &S,
    entity: &str,
) -> Result<bool, TripleStoreError> {
    let rows = find_by_eav(scanner, Some(entity), None, None, Order::Asc)?;
    let marker = Attribute::from(vec![COLLECTION_ATTRIBUTE]);
    Ok(!rows.is_empty() && rows.iter().all(|r| r.expired && r.attribute == marker))
}

#[cfg(test)]
mod tests {
    use super::{
        client_timestamp_scan, collection_scan, eav_scan, values_in_range_scan, Order,
        TimestampOp, ValueCursor, ValueRange,
    };
    use crate::clock::Timestamp;
    use crate::error::TripleStoreErrorCode;
    use crate::tuple::{Attribute, KeyElem, Value};

    #[test]
    fn timestamp_op_parses_known_operators() {
        for op in ["lt", "lte", "gt", "gte", "eq"] {
            let parsed: TimestampOp = op.parse().expect("known op");
            assert_eq!(parsed.as_str(), op);
        }
    }

    #[test]
    fn unknown_timestamp_op_fails_with_invalid_scan_op() {
        let err = "between".parse::<TimestampOp>().expect_err("unknown op");
        assert_eq!(err.code(), TripleStoreErrorCode::InvalidScanOp);
    }

    #[test]
    fn collection_scan_bounds_attribute_arrays() {
        let args = collection_scan("users", Order::Asc);
        assert_eq!(
            args.gte,
            Some(vec![KeyElem::Array(vec![KeyElem::Text("users".into())])])
        );
        assert_eq!(
            args.lt,
            Some(vec![KeyElem::Array(vec![
                KeyElem::Text("users".into()),
                KeyElem::Max
            ])])
        );
    }

    #[test]
    fn eav_scan_pads_missing_components_with_sentinels() {
        let args = eav_scan(Some("e1"), None, None, Order::Asc);
        assert_eq!(
            args.gte,
            Some(vec![
                KeyElem::Text("e1".into()),
                KeyElem::Min,
                KeyElem::Min
            ])
        );
        assert_eq!(
            args.lt,
            Some(vec![KeyElem::Text("e1".into()), KeyElem::Max, KeyElem::Max])
        );
    }

    #[test]
    fn eav_scan_caps_attribute_prefix() {
        let attr = Attribute::from(vec!["users"]);
        let args = eav_scan(Some("e1"), Some(&attr), None, Order::Asc);
        assert_eq!(
            args.lt,
            Some(vec![
                KeyElem::Text("e1".into()),
                KeyElem::Array(vec![KeyElem::Text("users".into()), KeyElem::Max]),
                KeyElem::Max
            ])
        );
    }

    #[test]
    fn vae_scan_with_entity_uses_the_exact_attribute_bound() {
        let attr = Attribute::from(vec!["x"]);
        let value = Value::Text("v".into());
        let exact = super::vae_scan(Some(&value), Some(&attr), Some("e1"), Order::Asc);
        assert_eq!(
            exact.lt,
            Some(vec![
                KeyElem::Text("v".into()),
                KeyElem::Array(vec![KeyElem::Text("x".into())]),
                KeyElem::Max
            ])
        );

        let prefixed = super::vae_scan(Some(&value), Some(&attr), None, Order::Asc);
        assert_eq!(
            prefixed.lt,
            Some(vec![
                KeyElem::Text("v".into()),
                KeyElem::Array(vec![KeyElem::Text("x".into()), KeyElem::Max]),
                KeyElem::Max
            ])
        );
    }

    #[test]
    fn eq_timestamp_scan_brackets_one_timestamp() {
        let t = Timestamp::new(3, "c1");
        let args = client_timestamp_scan("c1", TimestampOp::Eq, Some(&t)).expect("args");
        assert!(args.gte.is_some());
        assert!(args.lt.is_some());
        let lt = args.lt.unwrap();
        assert_eq!(
            lt,
            vec![KeyElem::Array(vec![
                KeyElem::Number(3.0),
                KeyElem::Text("c1".into()),
                KeyElem::Max
            ])]
        );
    }

    #[test]
    fn eq_without_timestamp_is_rejected() {
        let err = client_timestamp_scan("c1", TimestampOp::Eq, None).expect_err("no timestamp");
        assert_eq!(err.code(), TripleStoreErrorCode::InvalidScanOp);
    }

    #[test]
    fn value_range_cursors_pad_with_sentinels() {
        let attr = Attribute::from(vec!["users", "age"]);
        let range = ValueRange {
            greater_than: Some(ValueCursor::at(Value::Number(18.0))),
            less_than: Some(ValueCursor::at_entity(Value::Number(65.0), "e9")),
            order: Order::Asc,
        };
        let args = values_in_range_scan(&attr, &range);
        assert_eq!(
            args.gt,
            Some(vec![KeyElem::Number(18.0), KeyElem::Max, KeyElem::Max])
        );
        assert_eq!(
            args.lt,
            Some(vec![
                KeyElem::Number(65.0),
                KeyElem::Text("e9".into()),
                KeyElem::Min
            ])
        );
    }
}
