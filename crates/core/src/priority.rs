//! Task priority bands.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::value_object::ValueObject;

/// Priority band of a task, `0..=9`. Higher values are dispatched first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(0);
    pub const MAX: Priority = Priority(9);
    pub const DEFAULT: Priority = Priority(5);

    /// Number of distinct bands.
    pub const BANDS: usize = 10;

    /// Validate a raw priority. Values outside `0..=9` are a configuration error.
    pub fn new(value: i64) -> CoreResult<Self> {
        if (0..=9).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(CoreError::validation(format!(
                "priority must be within 0..=9, got {value}"
            )))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Index of the band in a `[_; Priority::BANDS]` array.
    pub fn band(self) -> usize {
        self.0 as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl ValueObject for Priority {}

impl TryFrom<u8> for Priority {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(i64::from(value))
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_is_five() {
        assert_eq!(Priority::default().value(), 5);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(Priority::new(-1).is_err());
        assert!(Priority::new(10).is_err());
        assert!(serde_json::from_str::<Priority>("12").is_err());
    }

    proptest! {
        #[test]
        fn accepts_exactly_the_ten_bands(raw in -100i64..100) {
            let result = Priority::new(raw);
            prop_assert_eq!(result.is_ok(), (0..=9).contains(&raw));
            if let Ok(p) = result {
                prop_assert!(p.band() < Priority::BANDS);
            }
        }
    }
}
