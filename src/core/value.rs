use crate::core::types::YearMonth;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Bound;

/// Key stored in a secondary index.
///
/// Values of the same variant are totally ordered, which is what range
/// queries over the `date` and `month` indices rely on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexValue {
    Bool(bool),
    Date(NaiveDate),
    Month(YearMonth),
    Text(String),
}

impl IndexValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Date(d) => write!(f, "{}", d),
            Self::Month(m) => write!(f, "{}", m),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<NaiveDate> for IndexValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<YearMonth> for IndexValue {
    fn from(value: YearMonth) -> Self {
        Self::Month(value)
    }
}

impl From<bool> for IndexValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Lookup against a secondary index: exact key or an ordered range.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexQuery {
    Eq(IndexValue),
    Range {
        lower: Bound<IndexValue>,
        upper: Bound<IndexValue>,
    },
}

impl IndexQuery {
    pub fn eq(value: impl Into<IndexValue>) -> Self {
        Self::Eq(value.into())
    }

    /// Inclusive on both ends.
    pub fn between(lower: impl Into<IndexValue>, upper: impl Into<IndexValue>) -> Self {
        Self::Range {
            lower: Bound::Included(lower.into()),
            upper: Bound::Included(upper.into()),
        }
    }

    pub fn at_least(lower: impl Into<IndexValue>) -> Self {
        Self::Range {
            lower: Bound::Included(lower.into()),
            upper: Bound::Unbounded,
        }
    }

    pub fn below(upper: impl Into<IndexValue>) -> Self {
        Self::Range {
            lower: Bound::Unbounded,
            upper: Bound::Excluded(upper.into()),
        }
    }

    /// An inverted range matches nothing instead of panicking in `BTreeMap::range`.
    pub(crate) fn is_empty_range(&self) -> bool {
        let Self::Range { lower, upper } = self else {
            return false;
        };
        match (lower, upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l), Bound::Excluded(u))
            | (Bound::Excluded(l), Bound::Included(u))
            | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dates_order_chronologically() {
        let a = IndexValue::from(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap());
        let b = IndexValue::from(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert!(a < b);
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let q = IndexQuery::between(
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        );
        assert!(q.is_empty_range());
        assert!(!IndexQuery::eq("Travel").is_empty_range());
        assert!(!IndexQuery::at_least("a").is_empty_range());
    }
}
