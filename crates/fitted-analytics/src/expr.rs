//! Resolved expressions and their row-level evaluation.
//!
//! Evaluation follows SQL three-valued logic: comparisons involving `NULL`
//! yield `NULL`, and a filter keeps only rows where it is `TRUE`.

use std::cmp::Ordering;

use fitted_weather::StoredRecord;

use crate::catalog::Field;
use crate::value::{like_match, Scalar};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Plus,
    Minus,
    Multiply,
    Divide,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq
        )
    }

    /// The operator with its operands swapped: `a < b` is `b > a`.
    pub fn flip(self) -> Self {
        match self {
            BinOp::Lt => BinOp::Gt,
            BinOp::LtEq => BinOp::GtEq,
            BinOp::Gt => BinOp::Lt,
            BinOp::GtEq => BinOp::LtEq,
            other => other,
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            BinOp::Eq => ordering == Ordering::Equal,
            BinOp::NotEq => ordering != Ordering::Equal,
            BinOp::Lt => ordering == Ordering::Less,
            BinOp::LtEq => ordering != Ordering::Greater,
            BinOp::Gt => ordering == Ordering::Greater,
            BinOp::GtEq => ordering != Ordering::Less,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggFunc::Count),
            "SUM" => Some(AggFunc::Sum),
            "AVG" => Some(AggFunc::Avg),
            "MIN" => Some(AggFunc::Min),
            "MAX" => Some(AggFunc::Max),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateCall {
    pub func: AggFunc,
    /// `None` for `COUNT(*)`
    pub arg: Option<Expr>,
    /// `COUNT(DISTINCT ...)`
    pub distinct: bool,
}

/// Functions applied to one value per row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarFunc {
    Lower,
    Upper,
}

impl ScalarFunc {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "LOWER" => Some(ScalarFunc::Lower),
            "UPPER" => Some(ScalarFunc::Upper),
            _ => None,
        }
    }

    /// Case mapping touches text only; other values pass through.
    fn apply(self, value: Scalar) -> Scalar {
        match (self, value) {
            (ScalarFunc::Lower, Scalar::Text(s)) => Scalar::Text(s.to_lowercase()),
            (ScalarFunc::Upper, Scalar::Text(s)) => Scalar::Text(s.to_uppercase()),
            (_, other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(Field),
    Literal(Scalar),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    Negate(Box<Expr>),
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
        case_insensitive: bool,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Function {
        func: ScalarFunc,
        arg: Box<Expr>,
    },
    /// Final value of the plan's aggregate in this slot
    Aggregate(usize),
}

/// What an expression is evaluated against.
///
/// Plain queries see one row at a time. Aggregate queries evaluate their
/// output against a group's first row plus the finished aggregate values.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub row: Option<&'a StoredRecord>,
    pub aggregates: &'a [Scalar],
}

impl<'a> Context<'a> {
    pub fn row(row: &'a StoredRecord) -> Self {
        Self {
            row: Some(row),
            aggregates: &[],
        }
    }
}

impl Expr {
    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Column(_) | Expr::Literal(_) | Expr::Aggregate(_) => Vec::new(),
            Expr::Binary { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            Expr::Not(expr)
            | Expr::Negate(expr)
            | Expr::IsNull { expr, .. }
            | Expr::Function { arg: expr, .. } => vec![expr.as_ref()],
            Expr::Between {
                expr, low, high, ..
            } => vec![expr.as_ref(), low.as_ref(), high.as_ref()],
            Expr::InList { expr, list, .. } => {
                let mut children = vec![expr.as_ref()];
                children.extend(list);
                children
            }
            Expr::Like { expr, pattern, .. } => vec![expr.as_ref(), pattern.as_ref()],
        }
    }

    pub fn contains_aggregate(&self) -> bool {
        matches!(self, Expr::Aggregate(_)) || self.children().iter().any(|c| c.contains_aggregate())
    }

    /// Whether the expression has one value per group: it is a grouping
    /// expression, or every column it reads sits inside an aggregate.
    pub fn is_grouped_by(&self, group_by: &[Expr]) -> bool {
        if group_by.contains(self) {
            return true;
        }
        match self {
            Expr::Column(_) => false,
            _ => self.children().iter().all(|c| c.is_grouped_by(group_by)),
        }
    }

    pub fn eval(&self, ctx: &Context<'_>) -> Scalar {
        match self {
            Expr::Column(field) => ctx.row.map_or(Scalar::Null, |row| field.read(row)),
            Expr::Literal(value) => value.clone(),
            Expr::Binary { op, left, right } => binary(*op, left.eval(ctx), right.eval(ctx)),
            Expr::Not(expr) => not(expr.eval(ctx)),
            Expr::Negate(expr) => match expr.eval(ctx) {
                Scalar::Int(i) => i.checked_neg().map_or(Scalar::Float(-(i as f64)), Scalar::Int),
                Scalar::Float(f) => Scalar::Float(-f),
                _ => Scalar::Null,
            },
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let value = expr.eval(ctx);
                let within = and(
                    binary(BinOp::GtEq, value.clone(), low.eval(ctx)),
                    binary(BinOp::LtEq, value, high.eval(ctx)),
                );
                if *negated {
                    not(within)
                } else {
                    within
                }
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => in_list(&expr.eval(ctx), list, *negated, ctx),
            Expr::Like {
                expr,
                pattern,
                negated,
                case_insensitive,
            } => match (expr.eval(ctx), pattern.eval(ctx)) {
                (Scalar::Text(text), Scalar::Text(pattern)) => {
                    let matched = if *case_insensitive {
                        like_match(&text.to_lowercase(), &pattern.to_lowercase())
                    } else {
                        like_match(&text, &pattern)
                    };
                    Scalar::Bool(matched != *negated)
                }
                _ => Scalar::Null,
            },
            Expr::IsNull { expr, negated } => Scalar::Bool(expr.eval(ctx).is_null() != *negated),
            Expr::Function { func, arg } => func.apply(arg.eval(ctx)),
            Expr::Aggregate(slot) => ctx.aggregates.get(*slot).cloned().unwrap_or(Scalar::Null),
        }
    }
}

fn not(value: Scalar) -> Scalar {
    match value {
        Scalar::Bool(b) => Scalar::Bool(!b),
        _ => Scalar::Null,
    }
}

fn and(left: Scalar, right: Scalar) -> Scalar {
    match (left.as_bool(), right.as_bool()) {
        (Some(false), _) | (_, Some(false)) => Scalar::Bool(false),
        (Some(true), Some(true)) => Scalar::Bool(true),
        _ => Scalar::Null,
    }
}

fn or(left: Scalar, right: Scalar) -> Scalar {
    match (left.as_bool(), right.as_bool()) {
        (Some(true), _) | (_, Some(true)) => Scalar::Bool(true),
        (Some(false), Some(false)) => Scalar::Bool(false),
        _ => Scalar::Null,
    }
}

fn in_list(value: &Scalar, list: &[Expr], negated: bool, ctx: &Context<'_>) -> Scalar {
    if value.is_null() {
        return Scalar::Null;
    }
    let mut saw_null = false;
    for item in list {
        let item = item.eval(ctx);
        match value.compare(&item) {
            Some(Ordering::Equal) => return Scalar::Bool(!negated),
            None if item.is_null() => saw_null = true,
            _ => {}
        }
    }
    if saw_null {
        Scalar::Null
    } else {
        Scalar::Bool(negated)
    }
}

fn binary(op: BinOp, left: Scalar, right: Scalar) -> Scalar {
    match op {
        BinOp::And => and(left, right),
        BinOp::Or => or(left, right),
        op if op.is_comparison() => left
            .compare(&right)
            .map_or(Scalar::Null, |ordering| Scalar::Bool(op.holds(ordering))),
        op => arithmetic(op, &left, &right),
    }
}

fn arithmetic(op: BinOp, left: &Scalar, right: &Scalar) -> Scalar {
    if let (Scalar::Int(a), Scalar::Int(b)) = (left, right) {
        let exact = match op {
            BinOp::Plus => a.checked_add(*b),
            BinOp::Minus => a.checked_sub(*b),
            BinOp::Multiply => a.checked_mul(*b),
            _ => None,
        };
        if let Some(result) = exact {
            return Scalar::Int(result);
        }
    }
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Scalar::Null;
    };
    match op {
        BinOp::Plus => Scalar::Float(a + b),
        BinOp::Minus => Scalar::Float(a - b),
        BinOp::Multiply => Scalar::Float(a * b),
        BinOp::Divide if b != 0.0 => Scalar::Float(a / b),
        _ => Scalar::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(value: Scalar) -> Expr {
        Expr::Literal(value)
    }

    fn eval(expr: &Expr) -> Scalar {
        expr.eval(&Context {
            row: None,
            aggregates: &[],
        })
    }

    #[test]
    fn test_three_valued_logic() {
        let null = lit(Scalar::Null);
        let t = lit(Scalar::Bool(true));
        let f = lit(Scalar::Bool(false));

        assert_eq!(eval(&Expr::binary(BinOp::And, null.clone(), f.clone())), Scalar::Bool(false));
        assert_eq!(eval(&Expr::binary(BinOp::And, null.clone(), t.clone())), Scalar::Null);
        assert_eq!(eval(&Expr::binary(BinOp::Or, null.clone(), t)), Scalar::Bool(true));
        assert_eq!(eval(&Expr::binary(BinOp::Or, null.clone(), f)), Scalar::Null);
        assert_eq!(eval(&Expr::Not(Box::new(null))), Scalar::Null);
    }

    #[test]
    fn test_comparison_with_null_is_null() {
        let expr = Expr::binary(BinOp::Eq, lit(Scalar::Null), lit(Scalar::Null));
        assert_eq!(eval(&expr), Scalar::Null);
        assert!(!eval(&expr).is_true());
    }

    #[test]
    fn test_between_is_inclusive() {
        let between = |v: i64, negated| Expr::Between {
            expr: Box::new(lit(Scalar::Int(v))),
            low: Box::new(lit(Scalar::Int(1))),
            high: Box::new(lit(Scalar::Int(3))),
            negated,
        };
        assert_eq!(eval(&between(1, false)), Scalar::Bool(true));
        assert_eq!(eval(&between(3, false)), Scalar::Bool(true));
        assert_eq!(eval(&between(4, false)), Scalar::Bool(false));
        assert_eq!(eval(&between(4, true)), Scalar::Bool(true));
    }

    #[test]
    fn test_in_list_with_null_member() {
        let in_list = |v: &str| Expr::InList {
            expr: Box::new(lit(Scalar::text(v))),
            list: vec![lit(Scalar::text("paris")), lit(Scalar::Null)],
            negated: false,
        };
        assert_eq!(eval(&in_list("paris")), Scalar::Bool(true));
        assert_eq!(eval(&in_list("rome")), Scalar::Null);
    }

    #[test]
    fn test_arithmetic() {
        let add = Expr::binary(BinOp::Plus, lit(Scalar::Int(2)), lit(Scalar::Int(3)));
        assert_eq!(eval(&add), Scalar::Int(5));

        let mixed = Expr::binary(BinOp::Multiply, lit(Scalar::Int(2)), lit(Scalar::Float(1.5)));
        assert_eq!(eval(&mixed), Scalar::Float(3.0));

        let div_zero = Expr::binary(BinOp::Divide, lit(Scalar::Int(1)), lit(Scalar::Int(0)));
        assert_eq!(eval(&div_zero), Scalar::Null);

        let negate = Expr::Negate(Box::new(lit(Scalar::Float(2.5))));
        assert_eq!(eval(&negate), Scalar::Float(-2.5));
    }

    #[test]
    fn test_like_case_sensitivity() {
        let like = |case_insensitive| Expr::Like {
            expr: Box::new(lit(Scalar::text("Partly cloudy"))),
            pattern: Box::new(lit(Scalar::text("partly%"))),
            negated: false,
            case_insensitive,
        };
        assert_eq!(eval(&like(false)), Scalar::Bool(false));
        assert_eq!(eval(&like(true)), Scalar::Bool(true));
    }

    #[test]
    fn test_case_functions() {
        let call = |func, value| Expr::Function {
            func,
            arg: Box::new(lit(value)),
        };
        assert_eq!(
            eval(&call(ScalarFunc::Lower, Scalar::text("Partly Cloudy"))),
            Scalar::text("partly cloudy")
        );
        assert_eq!(eval(&call(ScalarFunc::Upper, Scalar::text("paris"))), Scalar::text("PARIS"));
        assert_eq!(eval(&call(ScalarFunc::Lower, Scalar::Null)), Scalar::Null);
        assert_eq!(eval(&call(ScalarFunc::Upper, Scalar::Int(3))), Scalar::Int(3));
        assert_eq!(ScalarFunc::from_name("lower"), Some(ScalarFunc::Lower));
        assert_eq!(ScalarFunc::from_name("TRIM"), None);
    }

    #[test]
    fn test_grouping_check() {
        let group_by = vec![Expr::Column(Field::Location)];
        assert!(Expr::Column(Field::Location).is_grouped_by(&group_by));
        assert!(Expr::Aggregate(0).is_grouped_by(&group_by));
        assert!(!Expr::Column(Field::Dt).is_grouped_by(&group_by));

        let mixed = Expr::binary(BinOp::Plus, Expr::Aggregate(0), Expr::Column(Field::Dt));
        assert!(!mixed.is_grouped_by(&group_by));
        assert!(mixed.contains_aggregate());
    }
}
