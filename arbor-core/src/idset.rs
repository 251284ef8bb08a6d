//! Compact sets of broker ranks.
//!
//! Group membership travels on the wire in the ranged text form
//! `"0-3,5,8-9"`. The set itself is ordered so the encoder can emit ranges
//! deterministically.
//!
//! ```
//! use arbor_core::idset::IdSet;
//!
//! let mut ids: IdSet = "0-2,5".parse().unwrap();
//! ids.insert(3);
//! assert_eq!(ids.encode(), "0-3,5");
//! assert_eq!(ids.count(), 5);
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// An ordered set of rank ids with a ranged text encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdSet {
    ids: BTreeSet<u32>,
}

impl IdSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A set holding a single rank.
    #[must_use]
    pub fn single(id: u32) -> Self {
        let mut ids = BTreeSet::new();
        ids.insert(id);
        Self { ids }
    }

    pub fn insert(&mut self, id: u32) {
        self.ids.insert(id);
    }

    pub fn remove(&mut self, id: u32) -> bool {
        self.ids.remove(&id)
    }

    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Add every id in `other` to this set.
    pub fn union_with(&mut self, other: &IdSet) {
        self.ids.extend(other.ids.iter().copied());
    }

    /// Remove every id in `other` from this set.
    pub fn subtract(&mut self, other: &IdSet) {
        for id in &other.ids {
            self.ids.remove(id);
        }
    }

    /// The ids present in both sets.
    #[must_use]
    pub fn intersect(&self, other: &IdSet) -> IdSet {
        Self {
            ids: self.ids.intersection(&other.ids).copied().collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ids.iter().copied()
    }

    /// Encode to the ranged text form (`"0-3,5"`). The empty set encodes to
    /// an empty string.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let mut iter = self.ids.iter().copied();
        let Some(mut start) = iter.next() else {
            return out;
        };
        let mut end = start;
        let mut emit = |out: &mut String, start: u32, end: u32| {
            if !out.is_empty() {
                out.push(',');
            }
            if start == end {
                out.push_str(&start.to_string());
            } else {
                out.push_str(&format!("{start}-{end}"));
            }
        };
        for id in iter {
            if id == end + 1 {
                end = id;
            } else {
                emit(&mut out, start, end);
                start = id;
                end = id;
            }
        }
        emit(&mut out, start, end);
        out
    }

    /// Decode the ranged text form.
    ///
    /// # Errors
    ///
    /// Malformed numbers, inverted ranges and stray separators are rejected.
    pub fn decode(s: &str) -> Result<Self> {
        let mut ids = BTreeSet::new();
        if s.is_empty() {
            return Ok(Self { ids });
        }
        for token in s.split(',') {
            match token.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u32 = lo
                        .parse()
                        .map_err(|_| CoreError::InvalidIdset(s.to_owned()))?;
                    let hi: u32 = hi
                        .parse()
                        .map_err(|_| CoreError::InvalidIdset(s.to_owned()))?;
                    if lo > hi {
                        return Err(CoreError::InvalidIdset(s.to_owned()));
                    }
                    ids.extend(lo..=hi);
                }
                None => {
                    let id: u32 = token
                        .parse()
                        .map_err(|_| CoreError::InvalidIdset(s.to_owned()))?;
                    ids.insert(id);
                }
            }
        }
        Ok(Self { ids })
    }
}

impl fmt::Display for IdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for IdSet {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

impl FromIterator<u32> for IdSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_ranges() {
        let ids: IdSet = [0, 1, 2, 3, 5, 8, 9].into_iter().collect();
        assert_eq!(ids.encode(), "0-3,5,8-9");
        assert_eq!(IdSet::new().encode(), "");
        assert_eq!(IdSet::single(7).encode(), "7");
    }

    #[test]
    fn decode_roundtrip() {
        for text in ["", "0", "0-3", "0-3,5,8-9", "1,3,5"] {
            assert_eq!(IdSet::decode(text).unwrap().encode(), text);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        for text in ["x", "3-1", "1,,2", "-", "1-", "-2"] {
            assert!(IdSet::decode(text).is_err(), "accepted {text:?}");
        }
    }

    #[test]
    fn set_algebra() {
        let mut a: IdSet = [0, 1, 2].into_iter().collect();
        let b: IdSet = [2, 3].into_iter().collect();

        let both = a.intersect(&b);
        assert_eq!(both.encode(), "2");

        a.union_with(&b);
        assert_eq!(a.encode(), "0-3");

        a.subtract(&b);
        assert_eq!(a.encode(), "0-1");
    }

    #[test]
    fn membership() {
        let mut ids = IdSet::single(4);
        assert!(ids.contains(4));
        assert!(!ids.contains(5));
        assert!(ids.remove(4));
        assert!(!ids.remove(4));
        assert!(ids.is_empty());
    }
}
