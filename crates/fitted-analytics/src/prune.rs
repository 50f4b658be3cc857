//! Partition pruning.
//!
//! Comparisons of `dt` or `location` against literals narrow the
//! partitions listed from the store. `AND` intersects constraints, `OR`
//! unions them. The full filter is still evaluated per row, so pruning only
//! has to be conservative: it may keep a partition without matches, never
//! drop one with matches. Anything under `NOT` constrains nothing.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use fitted_weather::{DateFilter, PartitionFilter};

use crate::catalog::Field;
use crate::expr::{BinOp, Expr};
use crate::value::Scalar;

pub fn partition_filter(filter: Option<&Expr>) -> PartitionFilter {
    filter.map(constraint).unwrap_or_default()
}

fn constraint(expr: &Expr) -> PartitionFilter {
    match expr {
        Expr::Binary {
            op: BinOp::And,
            left,
            right,
        } => {
            let (left, right) = (constraint(left), constraint(right));
            PartitionFilter {
                dates: intersect(left.dates, right.dates),
                locations: match (left.locations, right.locations) {
                    (Some(a), Some(b)) => Some(a.intersection(&b).cloned().collect()),
                    (a, b) => a.or(b),
                },
            }
        }
        Expr::Binary {
            op: BinOp::Or,
            left,
            right,
        } => {
            let (left, right) = (constraint(left), constraint(right));
            PartitionFilter {
                dates: union(left.dates, right.dates),
                locations: match (left.locations, right.locations) {
                    (Some(mut a), Some(b)) => {
                        a.extend(b);
                        Some(a)
                    }
                    _ => None,
                },
            }
        }
        leaf => PartitionFilter {
            dates: date_constraint(leaf),
            locations: location_values(leaf),
        },
    }
}

/// Dates admitted by both filters.
fn intersect(a: DateFilter, b: DateFilter) -> DateFilter {
    match (a, b) {
        (DateFilter::Unbounded, other) | (other, DateFilter::Unbounded) => other,
        (DateFilter::Dates(dates), other) | (other, DateFilter::Dates(dates)) => {
            DateFilter::Dates(dates.into_iter().filter(|d| other.matches(*d)).collect())
        }
        (DateFilter::Union(parts), other) | (other, DateFilter::Union(parts)) => parts
            .into_iter()
            .map(|part| intersect(part, other.clone()))
            .fold(DateFilter::Dates(BTreeSet::new()), union),
        (
            DateFilter::Range { start: s1, end: e1 },
            DateFilter::Range { start: s2, end: e2 },
        ) => range(s1.max(s2), tighter_end(e1, e2)),
    }
}

/// Dates admitted by either filter.
fn union(a: DateFilter, b: DateFilter) -> DateFilter {
    if a.is_unbounded() || b.is_unbounded() {
        return DateFilter::Unbounded;
    }
    match (a, b) {
        (DateFilter::Dates(mut x), DateFilter::Dates(y)) => {
            x.extend(y);
            DateFilter::Dates(x)
        }
        (DateFilter::Dates(empty), other) | (other, DateFilter::Dates(empty))
            if empty.is_empty() =>
        {
            other
        }
        (a, b) => {
            let mut parts = Vec::new();
            for filter in [a, b] {
                match filter {
                    DateFilter::Union(inner) => parts.extend(inner),
                    other => parts.push(other),
                }
            }
            DateFilter::Union(parts)
        }
    }
}

fn tighter_end(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Option<NaiveDate> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn range(start: Option<NaiveDate>, end: Option<NaiveDate>) -> DateFilter {
    match (start, end) {
        (Some(s), Some(e)) if s > e => DateFilter::Dates(BTreeSet::new()),
        (start, end) => DateFilter::Range { start, end },
    }
}

/// Literal operand of a comparison whose other side is `column`, with the
/// operator oriented as `column op literal`.
fn column_comparison<'e>(expr: &'e Expr, column: Field) -> Option<(BinOp, &'e Scalar)> {
    let Expr::Binary { op, left, right } = expr else {
        return None;
    };
    if !op.is_comparison() {
        return None;
    }
    match (left.as_ref(), right.as_ref()) {
        (Expr::Column(c), Expr::Literal(value)) if *c == column => Some((*op, value)),
        (Expr::Literal(value), Expr::Column(c)) if *c == column => Some((op.flip(), value)),
        _ => None,
    }
}

fn literal(expr: &Expr) -> Option<&Scalar> {
    match expr {
        Expr::Literal(value) => Some(value),
        _ => None,
    }
}

/// Values from `column IN (...)` with only non-null literals.
fn in_list_values<'e>(expr: &'e Expr, column: Field) -> Option<Vec<&'e Scalar>> {
    match expr {
        Expr::InList {
            expr,
            list,
            negated: false,
        } if **expr == Expr::Column(column) => list
            .iter()
            .map(|item| literal(item).filter(|v| !v.is_null()))
            .collect(),
        _ => None,
    }
}

fn location_values(expr: &Expr) -> Option<BTreeSet<String>> {
    let text = |value: &Scalar| match value {
        Scalar::Text(s) => Some(s.clone()),
        _ => None,
    };

    if let Some((BinOp::Eq, value)) = column_comparison(expr, Field::Location) {
        return text(value).map(|s| BTreeSet::from([s]));
    }
    in_list_values(expr, Field::Location)?
        .into_iter()
        .map(text)
        .collect()
}

/// `dt` dates a single predicate admits. Bounds past the calendar admit nothing.
fn date_constraint(expr: &Expr) -> DateFilter {
    let nothing = || DateFilter::Dates(BTreeSet::new());

    if let Some((op, value)) = column_comparison(expr, Field::Dt) {
        let Some(date) = value.as_date() else {
            return DateFilter::Unbounded;
        };
        return match op {
            BinOp::Eq => DateFilter::Dates(BTreeSet::from([date])),
            BinOp::Gt => date.succ_opt().map_or_else(nothing, |d| range(Some(d), None)),
            BinOp::GtEq => range(Some(date), None),
            BinOp::Lt => date.pred_opt().map_or_else(nothing, |d| range(None, Some(d))),
            BinOp::LtEq => range(None, Some(date)),
            _ => DateFilter::Unbounded,
        };
    }

    if let Some(values) = in_list_values(expr, Field::Dt) {
        return values
            .into_iter()
            .map(Scalar::as_date)
            .collect::<Option<BTreeSet<_>>>()
            .map_or(DateFilter::Unbounded, DateFilter::Dates);
    }

    match expr {
        Expr::Between {
            expr,
            low,
            high,
            negated: false,
        } if **expr == Expr::Column(Field::Dt) => range(
            literal(low).and_then(Scalar::as_date),
            literal(high).and_then(Scalar::as_date),
        ),
        _ => DateFilter::Unbounded,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::plan::plan;

    fn filter_for(where_clause: &str) -> PartitionFilter {
        let sql = format!("SELECT dt FROM weather_data WHERE {where_clause}");
        plan(&sql, "weather_data").unwrap().partition_filter
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_equality_either_operand_order() {
        let expected = DateFilter::Dates(BTreeSet::from([date("2024-01-15")]));
        assert_eq!(filter_for("dt = '2024-01-15'").dates, expected);
        assert_eq!(filter_for("'2024-01-15' = dt").dates, expected);
    }

    #[test]
    fn test_between_and_in() {
        assert_eq!(
            filter_for("dt BETWEEN '2024-01-10' AND '2024-01-12'").dates,
            DateFilter::Range {
                start: Some(date("2024-01-10")),
                end: Some(date("2024-01-12")),
            }
        );
        assert_eq!(
            filter_for("dt IN ('2024-01-10', '2024-01-12')").dates,
            DateFilter::Dates(BTreeSet::from([date("2024-01-10"), date("2024-01-12")]))
        );
    }

    #[test]
    fn test_conjuncts_intersect() {
        let filter = filter_for(
            "dt IN ('2024-01-10', '2024-01-12') AND dt > '2024-01-10' AND location = 'paris'",
        );
        assert_eq!(
            filter.dates,
            DateFilter::Dates(BTreeSet::from([date("2024-01-12")]))
        );
        assert_eq!(filter.locations, Some(BTreeSet::from(["paris".to_string()])));
    }

    #[test]
    fn test_location_in_list() {
        let filter = filter_for("location IN ('paris', 'rome') AND location = 'rome'");
        assert_eq!(filter.locations, Some(BTreeSet::from(["rome".to_string()])));
        assert!(filter.dates.is_unbounded());
    }

    #[test]
    fn test_disjunction_with_unconstrained_branch_does_not_prune() {
        let filter = filter_for("dt = '2024-01-15' OR location = 'paris'");
        assert!(filter.dates.is_unbounded());
        assert_eq!(filter.locations, None);
    }

    #[test]
    fn test_disjunction_of_dates_unions() {
        let filter = filter_for("dt = '2024-01-14' OR dt = '2024-01-16'");
        assert_eq!(
            filter.dates,
            DateFilter::Dates(BTreeSet::from([date("2024-01-14"), date("2024-01-16")]))
        );
        assert!(!filter.dates.is_unbounded());
    }

    #[test]
    fn test_disjunction_of_ranges() {
        let filter = filter_for(
            "dt BETWEEN '2024-01-01' AND '2024-01-03' OR dt >= '2024-02-01' OR dt = '2024-01-20'",
        );
        assert!(!filter.dates.is_unbounded());
        assert!(filter.dates.matches(date("2024-01-02")));
        assert!(filter.dates.matches(date("2024-01-20")));
        assert!(filter.dates.matches(date("2024-03-09")));
        assert!(!filter.dates.matches(date("2024-01-10")));
        assert!(!filter.dates.matches(date("2023-12-31")));
    }

    #[test]
    fn test_disjunction_of_conjunctions() {
        let filter = filter_for(
            "(dt = '2024-01-14' AND location = 'paris') \
             OR (dt = '2024-01-16' AND location = 'rome')",
        );
        assert_eq!(
            filter.dates,
            DateFilter::Dates(BTreeSet::from([date("2024-01-14"), date("2024-01-16")]))
        );
        assert_eq!(
            filter.locations,
            Some(BTreeSet::from(["paris".to_string(), "rome".to_string()]))
        );
    }

    #[test]
    fn test_conjunction_narrows_a_union() {
        let filter = filter_for(
            "(dt < '2024-01-05' OR dt > '2024-01-20') AND dt BETWEEN '2024-01-03' AND '2024-01-22'",
        );
        assert!(filter.dates.matches(date("2024-01-04")));
        assert!(filter.dates.matches(date("2024-01-21")));
        assert!(!filter.dates.matches(date("2024-01-02")));
        assert!(!filter.dates.matches(date("2024-01-10")));
        assert!(!filter.dates.matches(date("2024-01-23")));
    }

    #[test]
    fn test_negations_do_not_prune() {
        assert!(filter_for("dt <> '2024-01-15'").dates.is_unbounded());
        assert!(filter_for("dt NOT BETWEEN '2024-01-10' AND '2024-01-12'").dates.is_unbounded());
        assert!(filter_for("NOT dt = '2024-01-15'").dates.is_unbounded());
    }

    #[test]
    fn test_contradiction_prunes_everything() {
        let filter = filter_for("dt = '2024-01-15' AND dt = '2024-01-16'");
        assert_eq!(filter.dates, DateFilter::Dates(BTreeSet::new()));
        assert!(!filter.dates.matches(date("2024-01-15")));

        let crossed = filter_for("dt > '2024-01-20' AND dt < '2024-01-10'");
        assert_eq!(crossed.dates, DateFilter::Dates(BTreeSet::new()));
    }
}
