//! SQL to query plan.
//!
//! Only the subset the engine can answer is accepted: a single `SELECT`
//! over the configured table with filters, aggregates, grouping, ordering
//! and a limit. Everything else is rejected with the clause that caused it.

use fitted_core::QueryError;
use fitted_weather::PartitionFilter;
use sqlparser::ast::{
    self, BinaryOperator, DataType, DuplicateTreatment, FunctionArg, FunctionArgExpr,
    FunctionArguments, GroupByExpr, Ident, Query, Select, SelectItem, SetExpr, Statement,
    TableFactor, UnaryOperator, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::catalog::{self, Field};
use crate::expr::{AggFunc, AggregateCall, BinOp, Expr, ScalarFunc};
use crate::prune;
use crate::value::{parse_date, Scalar};

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    /// Output column name: the alias, or the expression as written
    pub name: String,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SortTarget {
    /// Sort by an output column
    Output(usize),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub target: SortTarget,
    pub descending: bool,
    pub nulls_first: bool,
}

#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub projections: Vec<Projection>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub aggregates: Vec<AggregateCall>,
    pub order_by: Vec<SortKey>,
    pub limit: Option<usize>,
    /// Partitions that can hold matching rows
    pub partition_filter: PartitionFilter,
}

impl QueryPlan {
    pub fn is_aggregate(&self) -> bool {
        !self.aggregates.is_empty() || !self.group_by.is_empty()
    }

    /// No usable `dt` predicate: every date partition is listed.
    pub fn full_scan(&self) -> bool {
        self.partition_filter.dates.is_unbounded()
    }

    pub fn columns(&self) -> Vec<String> {
        self.projections.iter().map(|p| p.name.clone()).collect()
    }
}

/// Parse and validate `sql` against the table named `table`.
pub fn plan(sql: &str, table: &str) -> Result<QueryPlan, QueryError> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| QueryError::rejected(sql.trim(), e.to_string()))?;

    let [statement] = statements.as_slice() else {
        return Err(QueryError::rejected(
            sql.trim(),
            format!("expected exactly one statement, found {}", statements.len()),
        ));
    };
    let Statement::Query(query) = statement else {
        return Err(QueryError::rejected(
            statement.to_string(),
            "only SELECT queries are supported",
        ));
    };

    Planner {
        table,
        aggregates: Vec::new(),
    }
    .plan_query(query)
}

/// Where an expression appears, which decides whether aggregates are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// `WHERE`, `GROUP BY` and aggregate arguments
    Row,
    /// Projections and `ORDER BY`
    Output,
}

struct Planner<'a> {
    table: &'a str,
    aggregates: Vec<AggregateCall>,
}

impl Planner<'_> {
    fn plan_query(mut self, query: &Query) -> Result<QueryPlan, QueryError> {
        if let Some(with) = &query.with {
            return Err(QueryError::rejected(with.to_string(), "WITH is not supported"));
        }
        if let Some(offset) = &query.offset {
            return Err(QueryError::rejected(offset.to_string(), "OFFSET is not supported"));
        }
        if let Some(fetch) = &query.fetch {
            return Err(QueryError::rejected(fetch.to_string(), "FETCH is not supported"));
        }
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(QueryError::rejected(
                query.body.to_string(),
                "only a single SELECT is supported",
            ));
        };

        self.check_select(select)?;
        self.check_from(select)?;

        let filter = select
            .selection
            .as_ref()
            .map(|e| self.compile(e, Scope::Row))
            .transpose()?;

        let group_by = match &select.group_by {
            GroupByExpr::Expressions(exprs, modifiers) if modifiers.is_empty() => exprs
                .iter()
                .map(|e| self.compile(e, Scope::Row))
                .collect::<Result<Vec<_>, _>>()?,
            other => {
                return Err(QueryError::rejected(
                    other.to_string(),
                    "only plain GROUP BY expressions are supported",
                ))
            }
        };

        let projections = self.projections(&select.projection)?;

        let mut order_by = Vec::new();
        if let Some(clause) = &query.order_by {
            for item in &clause.exprs {
                let descending = item.asc == Some(false);
                order_by.push(SortKey {
                    target: self.sort_target(&item.expr, &projections)?,
                    descending,
                    nulls_first: item.nulls_first.unwrap_or(descending),
                });
            }
        }

        let limit = query.limit.as_ref().map(parse_limit).transpose()?;

        let plan = QueryPlan {
            partition_filter: prune::partition_filter(filter.as_ref()),
            projections,
            filter,
            group_by,
            aggregates: self.aggregates,
            order_by,
            limit,
        };
        check_grouping(&plan)?;
        Ok(plan)
    }

    fn check_select(&self, select: &Select) -> Result<(), QueryError> {
        let unsupported = if let Some(distinct) = &select.distinct {
            Some((distinct.to_string(), "DISTINCT is not supported"))
        } else if let Some(top) = &select.top {
            Some((top.to_string(), "TOP is not supported"))
        } else if let Some(into) = &select.into {
            Some((into.to_string(), "SELECT INTO is not supported"))
        } else if let Some(having) = &select.having {
            Some((format!("HAVING {having}"), "HAVING is not supported"))
        } else if let Some(qualify) = &select.qualify {
            Some((format!("QUALIFY {qualify}"), "window functions are not supported"))
        } else if !select.named_window.is_empty() {
            Some(("WINDOW".to_string(), "window functions are not supported"))
        } else if !select.lateral_views.is_empty() {
            Some(("LATERAL VIEW".to_string(), "lateral views are not supported"))
        } else {
            None
        };

        match unsupported {
            Some((clause, reason)) => Err(QueryError::rejected(clause, reason)),
            None => Ok(()),
        }
    }

    fn check_from(&self, select: &Select) -> Result<(), QueryError> {
        let [from] = select.from.as_slice() else {
            return Err(QueryError::rejected(
                select.to_string(),
                format!("expected FROM {}", self.table),
            ));
        };
        if let Some(join) = from.joins.first() {
            return Err(QueryError::rejected(join.to_string(), "joins are not supported"));
        }

        match &from.relation {
            TableFactor::Table { name, .. } => {
                let known = name
                    .0
                    .last()
                    .is_some_and(|ident| ident.value.eq_ignore_ascii_case(self.table));
                if known {
                    Ok(())
                } else {
                    Err(QueryError::rejected(
                        name.to_string(),
                        format!("unknown table, expected {}", self.table),
                    ))
                }
            }
            TableFactor::Derived { .. } => Err(QueryError::rejected(
                from.relation.to_string(),
                "subqueries are not supported",
            )),
            other => Err(QueryError::rejected(
                other.to_string(),
                "unsupported table reference",
            )),
        }
    }

    fn projections(&mut self, items: &[SelectItem]) -> Result<Vec<Projection>, QueryError> {
        let mut projections = Vec::with_capacity(items.len());
        for item in items {
            match item {
                SelectItem::UnnamedExpr(expr) => projections.push(Projection {
                    name: expr.to_string(),
                    expr: self.compile(expr, Scope::Output)?,
                }),
                SelectItem::ExprWithAlias { expr, alias } => projections.push(Projection {
                    name: alias.value.clone(),
                    expr: self.compile(expr, Scope::Output)?,
                }),
                SelectItem::Wildcard(_) => {
                    projections.extend(catalog::wildcard_columns().into_iter().map(|field| {
                        Projection {
                            name: field.name().to_string(),
                            expr: Expr::Column(field),
                        }
                    }))
                }
                other => {
                    return Err(QueryError::rejected(
                        other.to_string(),
                        "qualified wildcards are not supported, use *",
                    ))
                }
            }
        }
        Ok(projections)
    }

    fn sort_target(
        &mut self,
        expr: &ast::Expr,
        projections: &[Projection],
    ) -> Result<SortTarget, QueryError> {
        // ORDER BY 2
        if let ast::Expr::Value(Value::Number(n, _)) = expr {
            return n
                .parse::<usize>()
                .ok()
                .filter(|position| (1..=projections.len()).contains(position))
                .map(|position| SortTarget::Output(position - 1))
                .ok_or_else(|| {
                    QueryError::rejected(format!("ORDER BY {n}"), "position out of range")
                });
        }
        // ORDER BY alias
        if let ast::Expr::Identifier(ident) = expr {
            if let Some(index) = projections
                .iter()
                .position(|p| p.name.eq_ignore_ascii_case(&ident.value))
            {
                return Ok(SortTarget::Output(index));
            }
        }

        let compiled = self.compile(expr, Scope::Output)?;
        Ok(match projections.iter().position(|p| p.expr == compiled) {
            Some(index) => SortTarget::Output(index),
            None => SortTarget::Expr(compiled),
        })
    }

    fn compile(&mut self, expr: &ast::Expr, scope: Scope) -> Result<Expr, QueryError> {
        let compiled = match expr {
            ast::Expr::Identifier(ident) => Expr::Column(self.resolve(std::slice::from_ref(ident))?),
            ast::Expr::CompoundIdentifier(idents) => Expr::Column(self.resolve(idents)?),
            ast::Expr::Value(value) => Expr::Literal(literal(value, expr)?),
            ast::Expr::TypedString {
                data_type, value, ..
            } if matches!(data_type, DataType::Date) => {
                let date = parse_date(value)
                    .ok_or_else(|| QueryError::rejected(expr.to_string(), "invalid date literal"))?;
                Expr::Literal(Scalar::Text(date.to_string()))
            }
            ast::Expr::Nested(inner) => return self.compile(inner, scope),
            ast::Expr::UnaryOp { op, expr: inner } => match op {
                UnaryOperator::Not => Expr::Not(Box::new(self.compile(inner, scope)?)),
                UnaryOperator::Minus => Expr::Negate(Box::new(self.compile(inner, scope)?)),
                UnaryOperator::Plus => return self.compile(inner, scope),
                other => {
                    return Err(QueryError::rejected(
                        expr.to_string(),
                        format!("operator {other} is not supported"),
                    ))
                }
            },
            ast::Expr::BinaryOp { left, op, right } => {
                let Some(bin_op) = binary_op(op) else {
                    return Err(QueryError::rejected(
                        expr.to_string(),
                        format!("operator {op} is not supported"),
                    ));
                };
                let left = self.compile(left, scope)?;
                let right = self.compile(right, scope)?;
                if bin_op.is_comparison() {
                    let right = date_operand(&left, right, expr)?;
                    let left = date_operand(&right, left, expr)?;
                    return Ok(Expr::binary(bin_op, left, right));
                }
                Expr::binary(bin_op, left, right)
            }
            ast::Expr::Between {
                expr: inner,
                negated,
                low,
                high,
            } => {
                let inner = self.compile(inner, scope)?;
                let low = date_operand(&inner, self.compile(low, scope)?, expr)?;
                let high = date_operand(&inner, self.compile(high, scope)?, expr)?;
                Expr::Between {
                    expr: Box::new(inner),
                    low: Box::new(low),
                    high: Box::new(high),
                    negated: *negated,
                }
            }
            ast::Expr::InList {
                expr: inner,
                list,
                negated,
            } => {
                let inner = self.compile(inner, scope)?;
                let mut items = Vec::with_capacity(list.len());
                for item in list {
                    let item = self.compile(item, scope)?;
                    items.push(date_operand(&inner, item, expr)?);
                }
                Expr::InList {
                    expr: Box::new(inner),
                    list: items,
                    negated: *negated,
                }
            }
            ast::Expr::Like {
                negated,
                any,
                expr: inner,
                pattern,
                escape_char,
            }
            | ast::Expr::ILike {
                negated,
                any,
                expr: inner,
                pattern,
                escape_char,
            } => {
                if *any || escape_char.is_some() {
                    return Err(QueryError::rejected(
                        expr.to_string(),
                        "LIKE ANY and ESCAPE are not supported",
                    ));
                }
                Expr::Like {
                    expr: Box::new(self.compile(inner, scope)?),
                    pattern: Box::new(self.compile(pattern, scope)?),
                    negated: *negated,
                    case_insensitive: matches!(expr, ast::Expr::ILike { .. }),
                }
            }
            ast::Expr::IsNull(inner) => Expr::IsNull {
                expr: Box::new(self.compile(inner, scope)?),
                negated: false,
            },
            ast::Expr::IsNotNull(inner) => Expr::IsNull {
                expr: Box::new(self.compile(inner, scope)?),
                negated: true,
            },
            ast::Expr::Function(function) => self.function(function, expr, scope)?,
            ast::Expr::Subquery(_) | ast::Expr::InSubquery { .. } | ast::Expr::Exists { .. } => {
                return Err(QueryError::rejected(
                    expr.to_string(),
                    "subqueries are not supported",
                ))
            }
            _ => {
                return Err(QueryError::rejected(
                    expr.to_string(),
                    "unsupported expression",
                ))
            }
        };
        Ok(compiled)
    }

    fn function(
        &mut self,
        function: &ast::Function,
        expr: &ast::Expr,
        scope: Scope,
    ) -> Result<Expr, QueryError> {
        let name = function.name.to_string();
        if let Some(func) = ScalarFunc::from_name(&name) {
            return self.scalar_function(func, function, expr, scope);
        }
        match AggFunc::from_name(&name) {
            Some(func) => self.aggregate(func, function, expr, scope),
            None => Err(QueryError::rejected(
                expr.to_string(),
                format!("unknown function {name}"),
            )),
        }
    }

    fn scalar_function(
        &mut self,
        func: ScalarFunc,
        function: &ast::Function,
        expr: &ast::Expr,
        scope: Scope,
    ) -> Result<Expr, QueryError> {
        let text = expr.to_string();
        let name = function.name.to_string();
        if function.over.is_some() || function.filter.is_some() || !function.within_group.is_empty()
        {
            return Err(QueryError::rejected(
                text,
                format!("{name} does not take window or aggregate modifiers"),
            ));
        }
        let FunctionArguments::List(list) = &function.args else {
            return Err(QueryError::rejected(text, format!("{name} takes one argument")));
        };
        let ([FunctionArg::Unnamed(FunctionArgExpr::Expr(arg))], true, true) = (
            list.args.as_slice(),
            list.duplicate_treatment.is_none(),
            list.clauses.is_empty(),
        ) else {
            return Err(QueryError::rejected(text, format!("{name} takes one argument")));
        };

        Ok(Expr::Function {
            func,
            arg: Box::new(self.compile(arg, scope)?),
        })
    }

    fn aggregate(
        &mut self,
        func: AggFunc,
        function: &ast::Function,
        expr: &ast::Expr,
        scope: Scope,
    ) -> Result<Expr, QueryError> {
        let text = expr.to_string();
        let name = function.name.to_string();
        if scope == Scope::Row {
            return Err(QueryError::rejected(
                text,
                "aggregate functions are not allowed here",
            ));
        }
        if function.over.is_some() {
            return Err(QueryError::rejected(text, "window functions are not supported"));
        }
        if function.filter.is_some() || !function.within_group.is_empty() {
            return Err(QueryError::rejected(
                text,
                "aggregate modifiers are not supported",
            ));
        }

        let FunctionArguments::List(list) = &function.args else {
            return Err(QueryError::rejected(text, format!("{name} takes one argument")));
        };
        let distinct = matches!(list.duplicate_treatment, Some(DuplicateTreatment::Distinct));
        if distinct && func != AggFunc::Count {
            return Err(QueryError::rejected(
                text,
                "DISTINCT is only supported in COUNT",
            ));
        }
        let ([arg], true) = (list.args.as_slice(), list.clauses.is_empty()) else {
            return Err(QueryError::rejected(text, format!("{name} takes one argument")));
        };

        let arg = match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Wildcard) if func == AggFunc::Count && !distinct => {
                None
            }
            FunctionArg::Unnamed(FunctionArgExpr::Expr(inner)) => {
                Some(self.compile(inner, Scope::Row)?)
            }
            _ => return Err(QueryError::rejected(text, "unsupported argument")),
        };

        if let (AggFunc::Sum | AggFunc::Avg, Some(Expr::Column(field))) = (func, &arg) {
            if !field.ty().is_numeric() {
                return Err(QueryError::rejected(
                    text,
                    format!("{} is not numeric", field.name()),
                ));
            }
        }

        let call = AggregateCall {
            func,
            arg,
            distinct,
        };
        let slot = match self.aggregates.iter().position(|c| *c == call) {
            Some(slot) => slot,
            None => {
                self.aggregates.push(call);
                self.aggregates.len() - 1
            }
        };
        Ok(Expr::Aggregate(slot))
    }

    fn resolve(&self, idents: &[Ident]) -> Result<Field, QueryError> {
        let mut parts: Vec<String> = idents.iter().map(|i| i.value.to_lowercase()).collect();
        if parts.len() > 1 && parts[0].eq_ignore_ascii_case(self.table) {
            parts.remove(0);
        }
        let path = parts.join(".");
        catalog::lookup(&path).ok_or_else(|| QueryError::rejected(path, "unknown column"))
    }
}

fn literal(value: &Value, expr: &ast::Expr) -> Result<Scalar, QueryError> {
    match value {
        Value::Number(n, _) => n
            .parse::<i64>()
            .map(Scalar::Int)
            .or_else(|_| n.parse::<f64>().map(Scalar::Float))
            .map_err(|_| QueryError::rejected(expr.to_string(), "invalid number")),
        Value::SingleQuotedString(s) => Ok(Scalar::text(s)),
        Value::Boolean(b) => Ok(Scalar::Bool(*b)),
        Value::Null => Ok(Scalar::Null),
        _ => Err(QueryError::rejected(
            expr.to_string(),
            "unsupported literal",
        )),
    }
}

fn binary_op(op: &BinaryOperator) -> Option<BinOp> {
    Some(match op {
        BinaryOperator::Eq => BinOp::Eq,
        BinaryOperator::NotEq => BinOp::NotEq,
        BinaryOperator::Lt => BinOp::Lt,
        BinaryOperator::LtEq => BinOp::LtEq,
        BinaryOperator::Gt => BinOp::Gt,
        BinaryOperator::GtEq => BinOp::GtEq,
        BinaryOperator::And => BinOp::And,
        BinaryOperator::Or => BinOp::Or,
        BinaryOperator::Plus => BinOp::Plus,
        BinaryOperator::Minus => BinOp::Minus,
        BinaryOperator::Multiply => BinOp::Multiply,
        BinaryOperator::Divide => BinOp::Divide,
        _ => return None,
    })
}

/// Literals compared against `dt` must be dates; they are normalized so
/// that text comparison against partition dates is chronological.
fn date_operand(column: &Expr, operand: Expr, clause: &ast::Expr) -> Result<Expr, QueryError> {
    match (column, operand) {
        (Expr::Column(Field::Dt), Expr::Literal(Scalar::Text(text))) => parse_date(&text)
            .map(|date| Expr::Literal(Scalar::Text(date.to_string())))
            .ok_or_else(|| {
                QueryError::rejected(
                    clause.to_string(),
                    format!("'{text}' is not a valid dt (expected YYYY-MM-DD)"),
                )
            }),
        (Expr::Column(Field::Dt), Expr::Literal(literal)) if !literal.is_null() => {
            Err(QueryError::rejected(
                clause.to_string(),
                "dt must be compared with a 'YYYY-MM-DD' date",
            ))
        }
        (_, operand) => Ok(operand),
    }
}

fn parse_limit(expr: &ast::Expr) -> Result<usize, QueryError> {
    match expr {
        ast::Expr::Value(Value::Number(n, _)) => n.parse::<usize>().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        QueryError::rejected(
            format!("LIMIT {expr}"),
            "LIMIT must be a non-negative integer",
        )
    })
}

/// In an aggregate query every output must have a single value per group.
fn check_grouping(plan: &QueryPlan) -> Result<(), QueryError> {
    if !plan.is_aggregate() {
        return Ok(());
    }
    for projection in &plan.projections {
        if !projection.expr.is_grouped_by(&plan.group_by) {
            return Err(QueryError::rejected(
                projection.name.clone(),
                "must appear in GROUP BY or be used in an aggregate",
            ));
        }
    }
    for key in &plan.order_by {
        if let SortTarget::Expr(expr) = &key.target {
            if !expr.is_grouped_by(&plan.group_by) {
                return Err(QueryError::rejected(
                    "ORDER BY",
                    "sort keys must appear in GROUP BY or be used in an aggregate",
                ));
            }
        }
    }
    Ok(())
}
