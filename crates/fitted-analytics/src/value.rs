//! Runtime values flowing through query evaluation.

use std::cmp::Ordering;

use chrono::NaiveDate;
use serde_json::Value;

/// Partition date format, also accepted for `dt` literals
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn text(value: impl Into<String>) -> Self {
        Scalar::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Only `TRUE` passes a filter; `NULL` and `FALSE` do not.
    pub fn is_true(&self) -> bool {
        matches!(self, Scalar::Bool(true))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Scalar::Text(s) => parse_date(s),
            _ => None,
        }
    }

    /// SQL comparison. `None` when either side is `NULL` or the types
    /// cannot be compared.
    pub fn compare(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Null, _) | (_, Scalar::Null) => None,
            (Scalar::Int(a), Scalar::Int(b)) => Some(a.cmp(b)),
            (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
            (Scalar::Text(a), Scalar::Text(b)) => Some(a.cmp(b)),
            (Scalar::Text(text), number) if number.as_f64().is_some() => {
                let parsed = text.trim().parse::<f64>().ok()?;
                parsed.partial_cmp(&number.as_f64()?)
            }
            (number, Scalar::Text(_)) if number.as_f64().is_some() => {
                other.compare(self).map(Ordering::reverse)
            }
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }

    /// Total order used for sorting and MIN/MAX. Values of different types
    /// that do not compare fall back to a fixed type rank.
    pub fn sort_cmp(&self, other: &Scalar) -> Ordering {
        self.compare(other)
            .unwrap_or_else(|| self.type_rank().cmp(&other.type_rank()))
    }

    fn type_rank(&self) -> u8 {
        match self {
            Scalar::Bool(_) => 0,
            Scalar::Int(_) | Scalar::Float(_) => 1,
            Scalar::Text(_) => 2,
            Scalar::Null => 3,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::from(*i),
            Scalar::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Scalar::Text(s) => Value::String(s.clone()),
        }
    }
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), DATE_FORMAT).ok()
}

/// SQL `LIKE` matching: `%` is any run of characters, `_` exactly one.
pub fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    // Last `%` seen and the text position it is currently absorbing up to
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '_' || c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match backtrack {
                Some((star, absorbed)) => {
                    p = star + 1;
                    t = absorbed + 1;
                    backtrack = Some((star, absorbed + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '%')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_comparison_across_types() {
        assert_eq!(Scalar::Int(3).compare(&Scalar::Float(2.5)), Some(Ordering::Greater));
        assert_eq!(Scalar::Float(2.0).compare(&Scalar::Int(2)), Some(Ordering::Equal));
        assert_eq!(Scalar::text("50").compare(&Scalar::Int(40)), Some(Ordering::Greater));
        assert_eq!(Scalar::Int(40).compare(&Scalar::text("50")), Some(Ordering::Less));
    }

    #[test]
    fn test_null_and_mismatched_types_do_not_compare() {
        assert_eq!(Scalar::Null.compare(&Scalar::Int(1)), None);
        assert_eq!(Scalar::text("paris").compare(&Scalar::Int(1)), None);
        assert_eq!(Scalar::Bool(true).compare(&Scalar::text("x")), None);
    }

    #[test]
    fn test_sort_cmp_puts_null_last() {
        let mut values = vec![Scalar::Null, Scalar::Int(2), Scalar::Float(1.5)];
        values.sort_by(Scalar::sort_cmp);
        assert_eq!(values, vec![Scalar::Float(1.5), Scalar::Int(2), Scalar::Null]);
    }

    #[test]
    fn test_like_match() {
        assert!(like_match("Partly cloudy", "Partly%"));
        assert!(like_match("Partly cloudy", "%cloud%"));
        assert!(like_match("rain", "r_in"));
        assert!(like_match("", "%"));
        assert!(like_match("abcabc", "%abc"));
        assert!(!like_match("Sunny", "sunny"));
        assert!(!like_match("rain", "r_n"));
        assert!(!like_match("rain", "rain_"));
    }

    #[test]
    fn test_float_to_json() {
        assert_eq!(Scalar::Float(12.5).to_json(), serde_json::json!(12.5));
        assert_eq!(Scalar::Float(f64::NAN).to_json(), Value::Null);
        assert_eq!(Scalar::Int(7).to_json(), serde_json::json!(7));
    }

    #[test]
    fn test_parse_date() {
        assert!(parse_date("2024-01-15").is_some());
        assert!(parse_date("2024-13-01").is_none());
        assert!(parse_date("yesterday").is_none());
    }
}
