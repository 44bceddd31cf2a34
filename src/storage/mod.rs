pub mod encoded_key;
pub mod memory;
pub mod multi;

use crate::storage::encoded_key::{prefix_successor, EncodedKey};
use crate::tuple::KeyElem;
use std::ops::Bound;

/// Arguments for one ordered scan: a tuple prefix plus optional bounds on the
/// components after the prefix. Bounds follow tuple-extension semantics: a key
/// extending a `gt` bound tuple is greater than it, a key extending an `lt`
/// bound tuple is excluded by it.
#[derive(Debug, Clone, Default)]
pub struct ScanArgs {
    pub prefix: Vec<KeyElem>,
    pub gt: Option<Vec<KeyElem>>,
    pub gte: Option<Vec<KeyElem>>,
    pub lt: Option<Vec<KeyElem>>,
    pub lte: Option<Vec<KeyElem>>,
    pub reverse: bool,
}

impl ScanArgs {
    pub fn with_prefix(prefix: Vec<KeyElem>) -> Self {
        Self {
            prefix,
            ..Self::default()
        }
    }

    pub fn gte(mut self, bound: Vec<KeyElem>) -> Self {
        self.gte = Some(bound);
        self
    }

    pub fn gt(mut self, bound: Vec<KeyElem>) -> Self {
        self.gt = Some(bound);
        self
    }

    pub fn lt(mut self, bound: Vec<KeyElem>) -> Self {
        self.lt = Some(bound);
        self
    }

    pub fn lte(mut self, bound: Vec<KeyElem>) -> Self {
        self.lte = Some(bound);
        self
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    /// Resolves the scan into absolute byte bounds, with `ambient` prepended
    /// to the prefix (tenant/subspace scoping).
    pub fn key_range(&self, ambient: &[KeyElem]) -> KeyRange {
        let mut prefix = EncodedKey::from_elems(ambient);
        prefix = prefix.concat(&self.prefix);

        let lower = if let Some(gt) = &self.gt {
            Bound::Excluded(prefix.concat(gt))
        } else if let Some(gte) = &self.gte {
            Bound::Included(prefix.concat(gte))
        } else {
            Bound::Included(prefix.clone())
        };

        let upper = if let Some(lt) = &self.lt {
            Bound::Excluded(prefix.concat(lt))
        } else if let Some(lte) = &self.lte {
            Bound::Included(prefix.concat(lte))
        } else {
            match prefix_successor(&prefix) {
                Some(succ) => Bound::Excluded(succ),
                None => Bound::Unbounded,
            }
        };

        KeyRange { lower, upper }
    }
}

/// Absolute byte range over encoded keys.
#[derive(Debug, Clone)]
pub struct KeyRange {
    pub lower: Bound<EncodedKey>,
    pub upper: Bound<EncodedKey>,
}

impl KeyRange {
    pub fn contains(&self, key: &EncodedKey) -> bool {
        let above_lower = match &self.lower {
            Bound::Included(low) => key >= low,
            Bound::Excluded(low) => key > low,
            Bound::Unbounded => true,
        };
        let below_upper = match &self.upper {
            Bound::Included(high) => key <= high,
            Bound::Excluded(high) => key < high,
            Bound::Unbounded => true,
        };
        above_lower && below_upper
    }

    /// An inverted range scans nothing; ordered-map range calls reject it, so
    /// it is detected up front.
    pub fn is_degenerate(&self) -> bool {
        let low = match &self.lower {
            Bound::Included(k) | Bound::Excluded(k) => k,
            Bound::Unbounded => return false,
        };
        match &self.upper {
            Bound::Included(high) => low > high,
            Bound::Excluded(high) => low >= high,
            Bound::Unbounded => false,
        }
    }

    pub fn as_bounds(&self) -> (Bound<EncodedKey>, Bound<EncodedKey>) {
        (self.lower.clone(), self.upper.clone())
    }
}
