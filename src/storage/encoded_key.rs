use crate::error::TripleStoreError;
use crate::tuple::KeyElem;
use compact_str::CompactString;
use smallvec::SmallVec;

const TERMINATOR: u8 = 0x00;
const TAG_MIN: u8 = 0x01;
const TAG_NULL: u8 = 0x02;
const TAG_BOOLEAN: u8 = 0x03;
const TAG_NUMBER: u8 = 0x04;
const TAG_TEXT: u8 = 0x05;
const TAG_ARRAY: u8 = 0x06;
const TAG_MAX: u8 = 0xFE;
const ESCAPE: u8 = 0xFF;

/// Order-preserving byte encoding of a composite key.
///
/// Byte-lexicographic comparison of encodings equals component-wise
/// comparison of the source tuples, and a tuple sorts before every extension
/// of itself. `0x00` and `0xFF` are never tag bytes, which keeps text/array
/// terminators and the interior-nul escape unambiguous so every key decodes
/// back to its tuple.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EncodedKey {
    bytes: SmallVec<[u8; 64]>,
}

impl EncodedKey {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn from_elems(elems: &[KeyElem]) -> Self {
        let mut out = SmallVec::<[u8; 64]>::new();
        for elem in elems {
            encode_elem(elem, &mut out);
        }
        Self { bytes: out }
    }

    pub fn from_single(elem: &KeyElem) -> Self {
        Self::from_elems(std::slice::from_ref(elem))
    }

    /// Returns this key extended with more components.
    pub fn concat(&self, elems: &[KeyElem]) -> Self {
        let mut out = self.bytes.clone();
        for elem in elems {
            encode_elem(elem, &mut out);
        }
        Self { bytes: out }
    }

    pub fn decode(&self) -> Result<Vec<KeyElem>, TripleStoreError> {
        let mut elems = Vec::new();
        let mut pos = 0;
        while pos < self.bytes.len() {
            elems.push(decode_elem(&self.bytes, &mut pos)?);
        }
        Ok(elems)
    }
}

/// Smallest key strictly greater than every key starting with `prefix`, or
/// `None` when the prefix is all `0xFF`.
pub fn prefix_successor(prefix: &EncodedKey) -> Option<EncodedKey> {
    let mut next = prefix.bytes.clone();
    for i in (0..next.len()).rev() {
        if next[i] != 0xFF {
            next[i] += 1;
            next.truncate(i + 1);
            return Some(EncodedKey { bytes: next });
        }
    }
    None
}

fn encode_elem(elem: &KeyElem, out: &mut SmallVec<[u8; 64]>) {
    match elem {
        KeyElem::Min => out.push(TAG_MIN),
        KeyElem::Null => out.push(TAG_NULL),
        KeyElem::Boolean(b) => {
            out.push(TAG_BOOLEAN);
            out.push(u8::from(*b));
        }
        KeyElem::Number(n) => {
            out.push(TAG_NUMBER);
            // total order preserving float mapping: flip all bits of
            // negatives, flip only the sign bit of non-negatives.
            let bits = n.to_bits();
            let mapped = if (bits >> 63) == 1 {
                !bits
            } else {
                bits ^ 0x8000_0000_0000_0000
            };
            out.extend_from_slice(&mapped.to_be_bytes());
        }
        KeyElem::Text(s) => {
            out.push(TAG_TEXT);
            append_text(s, out);
        }
        KeyElem::Array(elems) => {
            out.push(TAG_ARRAY);
            for inner in elems {
                encode_elem(inner, out);
            }
            out.push(TERMINATOR);
        }
        KeyElem::Max => out.push(TAG_MAX),
    }
}

fn append_text(s: &str, out: &mut SmallVec<[u8; 64]>) {
    for byte in s.as_bytes() {
        if *byte == TERMINATOR {
            // Escape interior nulls so the terminator remains unambiguous.
            out.extend_from_slice(&[TERMINATOR, ESCAPE]);
        } else {
            out.push(*byte);
        }
    }
    out.push(TERMINATOR);
}

fn decode_elem(bytes: &[u8], pos: &mut usize) -> Result<KeyElem, TripleStoreError> {
    let tag = *bytes
        .get(*pos)
        .ok_or_else(|| TripleStoreError::Decode("truncated key".into()))?;
    *pos += 1;
    match tag {
        TAG_MIN => Ok(KeyElem::Min),
        TAG_NULL => Ok(KeyElem::Null),
        TAG_BOOLEAN => {
            let b = *bytes
                .get(*pos)
                .ok_or_else(|| TripleStoreError::Decode("truncated boolean key".into()))?;
            *pos += 1;
            Ok(KeyElem::Boolean(b != 0))
        }
        TAG_NUMBER => {
            let end = *pos + 8;
            let slice = bytes
                .get(*pos..end)
                .ok_or_else(|| TripleStoreError::Decode("truncated number key".into()))?;
            let mut be = [0u8; 8];
            be.copy_from_slice(slice);
            *pos = end;
            let mapped = u64::from_be_bytes(be);
            let bits = if (mapped >> 63) == 1 {
                mapped ^ 0x8000_0000_0000_0000
            } else {
                !mapped
            };
            Ok(KeyElem::Number(f64::from_bits(bits)))
        }
        TAG_TEXT => {
            let mut raw = Vec::new();
            loop {
                let byte = *bytes
                    .get(*pos)
                    .ok_or_else(|| TripleStoreError::Decode("unterminated text key".into()))?;
                *pos += 1;
                if byte != TERMINATOR {
                    raw.push(byte);
                    continue;
                }
                if bytes.get(*pos) == Some(&ESCAPE) {
                    raw.push(TERMINATOR);
                    *pos += 1;
                    continue;
                }
                break;
            }
            let text = std::str::from_utf8(&raw)
                .map_err(|e| TripleStoreError::Decode(format!("key text is not utf-8: {e}")))?;
            Ok(KeyElem::Text(CompactString::from(text)))
        }
        TAG_ARRAY => {
            let mut elems = Vec::new();
            loop {
                let byte = *bytes
                    .get(*pos)
                    .ok_or_else(|| TripleStoreError::Decode("unterminated array key".into()))?;
                if byte == TERMINATOR {
                    *pos += 1;
                    return Ok(KeyElem::Array(elems));
                }
                elems.push(decode_elem(bytes, pos)?);
            }
        }
        TAG_MAX => Ok(KeyElem::Max),
        other => Err(TripleStoreError::Decode(format!(
            "invalid key tag 0x{other:02x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{prefix_successor, EncodedKey};
    use crate::tuple::KeyElem;
    use proptest::prelude::*;

    fn text(s: &str) -> KeyElem {
        KeyElem::Text(s.into())
    }

    #[test]
    fn number_order_is_preserved() {
        let a = EncodedKey::from_single(&KeyElem::Number(-10.5));
        let b = EncodedKey::from_single(&KeyElem::Number(0.0));
        let c = EncodedKey::from_single(&KeyElem::Number(42.0));
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn composite_order_is_lexicographic() {
        let a = EncodedKey::from_elems(&[KeyElem::Number(1.0), text("a")]);
        let b = EncodedKey::from_elems(&[KeyElem::Number(1.0), text("b")]);
        let c = EncodedKey::from_elems(&[KeyElem::Number(2.0), text("a")]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn tuple_sorts_before_its_extensions() {
        let short = EncodedKey::from_elems(&[text("e1")]);
        let long = EncodedKey::from_elems(&[text("e1"), text("a")]);
        assert!(short < long);
    }

    #[test]
    fn sentinels_bound_concrete_components() {
        let min = EncodedKey::from_single(&KeyElem::Min);
        let max = EncodedKey::from_single(&KeyElem::Max);
        for elem in [
            KeyElem::Null,
            KeyElem::Boolean(true),
            KeyElem::Number(f64::MAX),
            text("zzzz"),
            KeyElem::Array(vec![KeyElem::Max]),
        ] {
            let key = EncodedKey::from_single(&elem);
            assert!(min < key, "Min must sort below {elem:?}");
            assert!(key < max, "{elem:?} must sort below Max");
        }
    }

    #[test]
    fn max_inside_array_caps_attribute_extensions() {
        let attr = EncodedKey::from_single(&KeyElem::Array(vec![text("users"), text("name")]));
        let cap = EncodedKey::from_single(&KeyElem::Array(vec![text("users"), KeyElem::Max]));
        let other = EncodedKey::from_single(&KeyElem::Array(vec![text("usersx")]));
        assert!(attr < cap);
        assert!(cap < other);
    }

    #[test]
    fn interior_nul_text_stays_ordered_and_decodable() {
        let plain = EncodedKey::from_single(&text("a"));
        let nul = EncodedKey::from_single(&KeyElem::Text("a\0".into()));
        let longer = EncodedKey::from_single(&text("ab"));
        assert!(plain < nul);
        assert!(nul < longer);
        assert_eq!(nul.decode().unwrap(), vec![KeyElem::Text("a\0".into())]);
    }

    #[test]
    fn prefix_successor_increments_last_byte() {
        let key = EncodedKey::from_bytes(vec![0x05, 0xAA, 0x00]);
        let next = prefix_successor(&key).expect("next");
        assert_eq!(next.as_slice(), &[0x05, 0xAA, 0x01]);
    }

    #[test]
    fn prefix_successor_of_all_ff_is_none() {
        let key = EncodedKey::from_bytes(vec![0xFF, 0xFF]);
        assert!(prefix_successor(&key).is_none());
    }

    fn arb_elem() -> impl Strategy<Value = KeyElem> {
        let leaf = prop_oneof![
            Just(KeyElem::Null),
            any::<bool>().prop_map(KeyElem::Boolean),
            any::<f64>()
                .prop_filter("finite only", |v| v.is_finite())
                .prop_map(KeyElem::Number),
            "\\PC{0,12}".prop_map(|s| KeyElem::Text(s.into())),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop::collection::vec(inner, 0..4).prop_map(KeyElem::Array)
        })
    }

    proptest! {
        #[test]
        fn roundtrip_tuple(elems in prop::collection::vec(arb_elem(), 0..5)) {
            let key = EncodedKey::from_elems(&elems);
            prop_assert_eq!(key.decode().unwrap(), elems);
        }

        #[test]
        fn byte_order_matches_component_order(a in arb_elem(), b in arb_elem()) {
            let ka = EncodedKey::from_single(&a);
            let kb = EncodedKey::from_single(&b);
            prop_assert_eq!(ka.cmp(&kb), a.cmp(&b));
        }

        #[test]
        fn byte_order_matches_tuple_order(
            a in prop::collection::vec(arb_elem(), 0..4),
            b in prop::collection::vec(arb_elem(), 0..4),
        ) {
            let ka = EncodedKey::from_elems(&a);
            let kb = EncodedKey::from_elems(&b);
            prop_assert_eq!(ka.cmp(&kb), a.iter().cmp(b.iter()));
        }
    }
}
