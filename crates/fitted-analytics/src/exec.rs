//! Row-at-a-time execution of a query plan.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use fitted_weather::StoredRecord;
use serde_json::Value;

use crate::expr::{AggFunc, AggregateCall, Context};
use crate::plan::{QueryPlan, SortKey, SortTarget};
use crate::value::Scalar;

#[derive(Debug, Clone)]
enum Accumulator {
    Count(i64),
    /// Rendered values seen so far
    CountDistinct(BTreeSet<String>),
    Sum {
        int: i64,
        float: f64,
        all_int: bool,
        seen: bool,
    },
    Avg {
        sum: f64,
        count: u64,
    },
    Min(Option<Scalar>),
    Max(Option<Scalar>),
}

impl Accumulator {
    fn new(func: AggFunc) -> Self {
        match func {
            AggFunc::Count => Accumulator::Count(0),
            AggFunc::Sum => Accumulator::Sum {
                int: 0,
                float: 0.0,
                all_int: true,
                seen: false,
            },
            AggFunc::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
            AggFunc::Min => Accumulator::Min(None),
            AggFunc::Max => Accumulator::Max(None),
        }
    }

    fn for_call(call: &AggregateCall) -> Self {
        match call.func {
            AggFunc::Count if call.distinct => Accumulator::CountDistinct(BTreeSet::new()),
            func => Accumulator::new(func),
        }
    }

    fn update(&mut self, call: &AggregateCall, ctx: &Context<'_>) {
        let value = match &call.arg {
            Some(arg) => arg.eval(ctx),
            // COUNT(*) counts rows
            None => Scalar::Bool(true),
        };
        if value.is_null() {
            return;
        }

        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::CountDistinct(seen) => {
                seen.insert(value.to_json().to_string());
            }
            Accumulator::Sum {
                int,
                float,
                all_int,
                seen,
            } => match value {
                Scalar::Int(i) => {
                    match int.checked_add(i) {
                        Some(total) => *int = total,
                        None => *all_int = false,
                    }
                    *float += i as f64;
                    *seen = true;
                }
                Scalar::Float(f) => {
                    *float += f;
                    *all_int = false;
                    *seen = true;
                }
                _ => {}
            },
            Accumulator::Avg { sum, count } => {
                if let Some(v) = value.as_f64() {
                    *sum += v;
                    *count += 1;
                }
            }
            Accumulator::Min(current) => {
                if current.as_ref().map_or(true, |c| value.sort_cmp(c) == Ordering::Less) {
                    *current = Some(value);
                }
            }
            Accumulator::Max(current) => {
                if current.as_ref().map_or(true, |c| value.sort_cmp(c) == Ordering::Greater) {
                    *current = Some(value);
                }
            }
        }
    }

    fn finish(&self) -> Scalar {
        match self {
            Accumulator::Count(n) => Scalar::Int(*n),
            Accumulator::CountDistinct(seen) => {
                Scalar::Int(i64::try_from(seen.len()).unwrap_or(i64::MAX))
            }
            Accumulator::Sum { seen: false, .. } => Scalar::Null,
            Accumulator::Sum {
                int, all_int: true, ..
            } => Scalar::Int(*int),
            Accumulator::Sum { float, .. } => Scalar::Float(*float),
            Accumulator::Avg { count: 0, .. } => Scalar::Null,
            Accumulator::Avg { sum, count } => Scalar::Float(*sum / *count as f64),
            Accumulator::Min(value) | Accumulator::Max(value) => {
                value.clone().unwrap_or(Scalar::Null)
            }
        }
    }
}

#[derive(Debug)]
struct OutputRow {
    values: Vec<Scalar>,
    sort_keys: Vec<Scalar>,
}

#[derive(Debug)]
struct Group {
    /// First row of the group, for evaluating grouping expressions
    first: StoredRecord,
    accumulators: Vec<Accumulator>,
}

#[derive(Debug)]
enum State {
    Rows(Vec<OutputRow>),
    Groups {
        groups: Vec<Group>,
        index: HashMap<String, usize>,
    },
}

/// Consumes scanned rows and produces the result table.
#[derive(Debug)]
pub struct Executor<'p> {
    plan: &'p QueryPlan,
    state: State,
}

impl<'p> Executor<'p> {
    pub fn new(plan: &'p QueryPlan) -> Self {
        let state = if plan.is_aggregate() {
            State::Groups {
                groups: Vec::new(),
                index: HashMap::new(),
            }
        } else {
            State::Rows(Vec::new())
        };
        Self { plan, state }
    }

    pub fn push(&mut self, row: StoredRecord) {
        let ctx = Context::row(&row);
        if let Some(filter) = &self.plan.filter {
            if !filter.eval(&ctx).is_true() {
                return;
            }
        }

        match &mut self.state {
            State::Rows(rows) => rows.push(output_row(self.plan, &ctx)),
            State::Groups { groups, index } => {
                let key = group_key(self.plan, &ctx);
                let slot = match index.get(&key) {
                    Some(&slot) => slot,
                    None => {
                        groups.push(Group {
                            first: row.clone(),
                            accumulators: self
                                .plan
                                .aggregates
                                .iter()
                                .map(Accumulator::for_call)
                                .collect(),
                        });
                        index.insert(key, groups.len() - 1);
                        groups.len() - 1
                    }
                };
                if let Some(group) = groups.get_mut(slot) {
                    for (accumulator, call) in
                        group.accumulators.iter_mut().zip(&self.plan.aggregates)
                    {
                        accumulator.update(call, &ctx);
                    }
                }
            }
        }
    }

    /// True once more rows cannot change the result: an unordered,
    /// non-aggregate query that already holds `LIMIT` rows.
    pub fn is_saturated(&self) -> bool {
        match (&self.state, self.plan.limit) {
            (State::Rows(rows), Some(limit)) => {
                self.plan.order_by.is_empty() && rows.len() >= limit
            }
            _ => false,
        }
    }

    /// Sort, limit and render the result rows.
    pub fn finish(self) -> Vec<Vec<Value>> {
        let plan = self.plan;
        let mut rows = match self.state {
            State::Rows(rows) => rows,
            State::Groups { groups, .. } if groups.is_empty() && plan.group_by.is_empty() => {
                // Aggregates over nothing still produce one row
                let aggregates: Vec<Scalar> = plan
                    .aggregates
                    .iter()
                    .map(|call| Accumulator::for_call(call).finish())
                    .collect();
                let ctx = Context {
                    row: None,
                    aggregates: &aggregates,
                };
                vec![output_row(plan, &ctx)]
            }
            State::Groups { groups, .. } => groups
                .iter()
                .map(|group| {
                    let aggregates: Vec<Scalar> =
                        group.accumulators.iter().map(Accumulator::finish).collect();
                    let ctx = Context {
                        row: Some(&group.first),
                        aggregates: &aggregates,
                    };
                    output_row(plan, &ctx)
                })
                .collect(),
        };

        if !plan.order_by.is_empty() {
            rows.sort_by(|a, b| compare_rows(&plan.order_by, a, b));
        }
        if let Some(limit) = plan.limit {
            rows.truncate(limit);
        }

        rows.into_iter()
            .map(|row| row.values.iter().map(Scalar::to_json).collect())
            .collect()
    }
}

fn output_row(plan: &QueryPlan, ctx: &Context<'_>) -> OutputRow {
    let values: Vec<Scalar> = plan.projections.iter().map(|p| p.expr.eval(ctx)).collect();
    let sort_keys = plan
        .order_by
        .iter()
        .map(|key| match &key.target {
            SortTarget::Output(index) => values.get(*index).cloned().unwrap_or(Scalar::Null),
            SortTarget::Expr(expr) => expr.eval(ctx),
        })
        .collect();
    OutputRow { values, sort_keys }
}

fn group_key(plan: &QueryPlan, ctx: &Context<'_>) -> String {
    Value::Array(plan.group_by.iter().map(|e| e.eval(ctx).to_json()).collect()).to_string()
}

fn compare_rows(keys: &[SortKey], a: &OutputRow, b: &OutputRow) -> Ordering {
    for ((key, x), y) in keys.iter().zip(&a.sort_keys).zip(&b.sort_keys) {
        let ordering = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if key.nulls_first => Ordering::Less,
            (true, false) => Ordering::Greater,
            (false, true) if key.nulls_first => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) if key.descending => y.sort_cmp(x),
            (false, false) => x.sort_cmp(y),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}
