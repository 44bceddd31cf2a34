use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Scalar value domain of a fact.
///
/// Numbers use `f64::total_cmp` so the value order is total; write paths
/// reject non-finite numbers before they can reach an index key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Number(f64),
    Text(CompactString),
}

impl Value {
    fn kind_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Number(_) => 2,
            Value::Text(_) => 3,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        match self {
            Value::Number(n) => n.is_finite(),
            _ => true,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// One component of an attribute path: a name or a positional index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AttrPart {
    Number(f64),
    Text(CompactString),
}

impl AttrPart {
    fn kind_rank(&self) -> u8 {
        match self {
            AttrPart::Number(_) => 0,
            AttrPart::Text(_) => 1,
        }
    }
}

impl PartialEq for AttrPart {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for AttrPart {}

impl PartialOrd for AttrPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AttrPart {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }
        match (self, other) {
            (AttrPart::Number(a), AttrPart::Number(b)) => a.total_cmp(b),
            (AttrPart::Text(a), AttrPart::Text(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

impl From<&str> for AttrPart {
    fn from(s: &str) -> Self {
        AttrPart::Text(s.into())
    }
}

impl From<f64> for AttrPart {
    fn from(n: f64) -> Self {
        AttrPart::Number(n)
    }
}

impl From<usize> for AttrPart {
    fn from(n: usize) -> Self {
        AttrPart::Number(n as f64)
    }
}

/// An attribute path. The first component conventionally names the collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Attribute(Vec<AttrPart>);

impl Attribute {
    pub fn new(parts: Vec<AttrPart>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[AttrPart] {
        &self.0
    }

    pub fn first(&self) -> Option<&AttrPart> {
        self.0.first()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<P: Into<AttrPart>> FromIterator<P> for Attribute {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl From<Vec<&str>> for Attribute {
    fn from(parts: Vec<&str>) -> Self {
        parts.into_iter().collect()
    }
}

impl From<&[&str]> for Attribute {
    fn from(parts: &[&str]) -> Self {
        parts.iter().copied().collect()
    }
}

/// One component of a composite index key.
///
/// `Min` and `Max` are comparison artifacts used to build half-open scan
/// bounds; they never appear in stored keys. The order is
/// `Min < Null < Boolean < Number < Text < Array < Max`, arrays compared
/// component-wise recursively.
#[derive(Debug, Clone)]
pub enum KeyElem {
    Min,
    Null,
    Boolean(bool),
    Number(f64),
    Text(CompactString),
    Array(Vec<KeyElem>),
    Max,
}

impl KeyElem {
    fn kind_rank(&self) -> u8 {
        match self {
            KeyElem::Min => 0,
            KeyElem::Null => 1,
            KeyElem::Boolean(_) => 2,
            KeyElem::Number(_) => 3,
            KeyElem::Text(_) => 4,
            KeyElem::Array(_) => 5,
            KeyElem::Max => 6,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, KeyElem::Min | KeyElem::Max)
    }
}

impl PartialEq for KeyElem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyElem {}

impl PartialOrd for KeyElem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyElem {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }
        match (self, other) {
            (KeyElem::Boolean(a), KeyElem::Boolean(b)) => a.cmp(b),
            (KeyElem::Number(a), KeyElem::Number(b)) => a.total_cmp(b),
            (KeyElem::Text(a), KeyElem::Text(b)) => a.cmp(b),
            (KeyElem::Array(a), KeyElem::Array(b)) => a.iter().cmp(b.iter()),
            _ => Ordering::Equal,
        }
    }
}

impl From<&Value> for KeyElem {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => KeyElem::Null,
            Value::Boolean(b) => KeyElem::Boolean(*b),
            Value::Number(n) => KeyElem::Number(*n),
            Value::Text(s) => KeyElem::Text(s.clone()),
        }
    }
}

impl From<&AttrPart> for KeyElem {
    fn from(p: &AttrPart) -> Self {
        match p {
            AttrPart::Number(n) => KeyElem::Number(*n),
            AttrPart::Text(s) => KeyElem::Text(s.clone()),
        }
    }
}

impl From<&Attribute> for KeyElem {
    fn from(a: &Attribute) -> Self {
        KeyElem::Array(a.parts().iter().map(KeyElem::from).collect())
    }
}

impl From<&str> for KeyElem {
    fn from(s: &str) -> Self {
        KeyElem::Text(s.into())
    }
}

#[cfg(test)]
mod tests {
    use super::{AttrPart, Attribute, KeyElem, Value};

    #[test]
    fn value_kinds_order_null_bool_number_text() {
        let mut values = vec![
            Value::Text("a".into()),
            Value::Number(-3.5),
            Value::Null,
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Number(7.0),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Boolean(false),
                Value::Boolean(true),
                Value::Number(-3.5),
                Value::Number(7.0),
                Value::Text("a".into()),
            ]
        );
    }

    #[test]
    fn sentinels_bound_every_concrete_element() {
        let concrete = [
            KeyElem::Null,
            KeyElem::Boolean(true),
            KeyElem::Number(f64::MAX),
            KeyElem::Text("zzz".into()),
            KeyElem::Array(vec![KeyElem::Max]),
        ];
        for elem in &concrete {
            assert!(KeyElem::Min < *elem, "Min should sort below {elem:?}");
            assert!(*elem < KeyElem::Max, "{elem:?} should sort below Max");
        }
    }

    #[test]
    fn array_prefix_sorts_before_extension() {
        let short = KeyElem::Array(vec![KeyElem::Text("users".into())]);
        let long = KeyElem::Array(vec![
            KeyElem::Text("users".into()),
            KeyElem::Text("name".into()),
        ]);
        let capped = KeyElem::Array(vec![KeyElem::Text("users".into()), KeyElem::Max]);
        assert!(short < long);
        assert!(long < capped);
    }

    #[test]
    fn attribute_builds_from_mixed_parts() {
        let attr: Attribute = [AttrPart::from("todos"), AttrPart::from(0usize)]
            .into_iter()
            .collect();
        assert_eq!(attr.len(), 2);
        assert_eq!(attr.first(), Some(&AttrPart::Text("todos".into())));
    }

    #[test]
    fn non_finite_numbers_are_rejected() {
        assert!(!Value::Number(f64::NAN).is_well_formed());
        assert!(!Value::Number(f64::INFINITY).is_well_formed());
        assert!(Value::Number(0.0).is_well_formed());
        assert!(Value::Null.is_well_formed());
    }
}
