//! Fiscal quarters used for the time series and for per-quarter documents.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ConfigError;

const MIN_YEAR: i32 = 1990;
const MAX_YEAR: i32 = 2100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Quarter {
    year: i32,
    q: u8,
}

impl Quarter {
    pub fn new(year: i32, q: u8) -> Result<Self, ConfigError> {
        if !(1..=4).contains(&q) {
            return Err(ConfigError::InvalidDateRange(format!(
                "quarter must be 1..=4 (got {q})"
            )));
        }
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(ConfigError::InvalidDateRange(format!(
                "year must be within {MIN_YEAR}..={MAX_YEAR} (got {year})"
            )));
        }
        Ok(Self { year, q })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn number(&self) -> u8 {
        self.q
    }

    pub fn next(&self) -> Self {
        if self.q == 4 {
            Self {
                year: self.year + 1,
                q: 1,
            }
        } else {
            Self {
                year: self.year,
                q: self.q + 1,
            }
        }
    }

    /// `count` consecutive quarters starting at `self`.
    pub fn series(&self, count: usize) -> Vec<Quarter> {
        let mut out = Vec::with_capacity(count);
        let mut current = *self;
        for _ in 0..count {
            out.push(current);
            current = current.next();
        }
        out
    }

    /// Last calendar day of the quarter.
    pub fn end_date(&self) -> NaiveDate {
        let (year, month) = if self.q == 4 {
            (self.year + 1, 1)
        } else {
            (self.year, u32::from(self.q) * 3 + 1)
        };
        NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|d| d.pred_opt())
            .unwrap_or(NaiveDate::MIN)
    }
}

impl fmt::Display for Quarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Q{}", self.year, self.q)
    }
}

impl FromStr for Quarter {
    type Err = ConfigError;

    /// Accepts `2024Q1`, `2024-Q1` and `Q1 2024` (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidDateRange(format!("cannot parse quarter `{s}`"));
        let cleaned: String = s
            .trim()
            .to_ascii_uppercase()
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();

        let (year_part, q_part) = if let Some(rest) = cleaned.strip_prefix('Q') {
            // Q1 2024 -> "Q12024"
            if rest.len() < 2 {
                return Err(invalid());
            }
            (rest[1..].to_string(), rest[..1].to_string())
        } else {
            let (y, q) = cleaned.split_once('Q').ok_or_else(invalid)?;
            (y.to_string(), q.to_string())
        };

        let year: i32 = year_part.parse().map_err(|_| invalid())?;
        let q: u8 = q_part.parse().map_err(|_| invalid())?;
        Quarter::new(year, q)
    }
}

impl TryFrom<String> for Quarter {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Quarter> for String {
    fn from(q: Quarter) -> Self {
        q.to_string()
    }
}
