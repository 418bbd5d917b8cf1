//! Filtered, ordered, joined reads over backend tables.
//!
//! A [`Query`] is evaluated directly by the in-memory backend and rendered
//! to PostgREST query parameters by the REST backend, so both share one
//! description of "what to read".

use std::cmp::Ordering;

use serde_json::Value;

use pulse_core::parse_timestamp;

use crate::row::{column, scalar_eq, scalar_text, Row};

// ── Filter ──────────────────────────────────────────────────────────

/// A single column predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
    /// Greater than or equal. Timestamps compare chronologically.
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(column.into(), value.into())
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(c, _)
            | Filter::In(c, _)
            | Filter::Gte(c, _)
            | Filter::Lt(c, _)
            | Filter::Lte(c, _) => c,
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        let Some(actual) = column(row, self.column()) else {
            return false;
        };
        match self {
            Filter::Eq(_, expected) => scalar_eq(actual, expected),
            Filter::In(_, options) => options.iter().any(|o| scalar_eq(actual, o)),
            Filter::Gte(_, bound) => compare_values(actual, bound) != Ordering::Less,
            Filter::Lt(_, bound) => compare_values(actual, bound) == Ordering::Less,
            Filter::Lte(_, bound) => compare_values(actual, bound) != Ordering::Greater,
        }
    }

    /// `col.op.value` form used inside `or=(...)`.
    fn render_inline(&self) -> String {
        match self {
            Filter::Eq(c, v) => format!("{}.eq.{}", c, quote(v)),
            Filter::In(c, vs) => format!("{}.in.({})", c, join_quoted(vs)),
            Filter::Gte(c, v) => format!("{}.gte.{}", c, quote(v)),
            Filter::Lt(c, v) => format!("{}.lt.{}", c, quote(v)),
            Filter::Lte(c, v) => format!("{}.lte.{}", c, quote(v)),
        }
    }

    /// `(col, op.value)` form used as a top-level query parameter.
    fn render_param(&self) -> (String, String) {
        match self {
            Filter::Eq(c, v) => (c.clone(), format!("eq.{}", quote(v))),
            Filter::In(c, vs) => (c.clone(), format!("in.({})", join_quoted(vs))),
            Filter::Gte(c, v) => (c.clone(), format!("gte.{}", quote(v))),
            Filter::Lt(c, v) => (c.clone(), format!("lt.{}", quote(v))),
            Filter::Lte(c, v) => (c.clone(), format!("lte.{}", quote(v))),
        }
    }
}

/// Every filter in `filters` matches `row`.
pub fn matches_all(filters: &[Filter], row: &Row) -> bool {
    filters.iter().all(|f| f.matches(row))
}

// ── Order / Join ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// Many-to-one embed: `row[local]` references `table.id`, attached to the
/// result row under `alias` (null when the referenced row is missing).
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub alias: String,
    pub table: String,
    pub local: String,
}

// ── Query ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub filters: Vec<Filter>,
    /// OR of AND-groups, combined with `filters` by AND.
    pub any_of: Vec<Vec<Filter>>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub joins: Vec<Join>,
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            any_of: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            joins: Vec::new(),
        }
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.into(), value.into()));
        self
    }

    pub fn in_list<I, V>(mut self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.filters.push(Filter::In(column.into(), values));
        self
    }

    pub fn gte(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Gte(column.into(), value.into()));
        self
    }

    /// Rows strictly after `(key, id)` in a `key desc, id desc` ordering.
    /// Replaces any `any_of` groups.
    pub fn before(mut self, key: impl Into<String>, value: impl Into<Value>, id: impl Into<Value>) -> Self {
        let key = key.into();
        let value = value.into();
        self.any_of = vec![
            vec![Filter::Lt(key.clone(), value.clone())],
            vec![Filter::Lte(key, value), Filter::Lt("id".into(), id.into())],
        ];
        self
    }

    pub fn any_of(mut self, groups: Vec<Vec<Filter>>) -> Self {
        self.any_of = groups;
        self
    }

    pub fn order_asc(mut self, column: impl Into<String>) -> Self {
        self.order.push(Order {
            column: column.into(),
            ascending: true,
        });
        self
    }

    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order.push(Order {
            column: column.into(),
            ascending: false,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn join(
        mut self,
        alias: impl Into<String>,
        table: impl Into<String>,
        local: impl Into<String>,
    ) -> Self {
        self.joins.push(Join {
            alias: alias.into(),
            table: table.into(),
            local: local.into(),
        });
        self
    }

    /// Row passes `filters` and at least one `any_of` group (if any).
    pub fn matches(&self, row: &Row) -> bool {
        matches_all(&self.filters, row)
            && (self.any_of.is_empty() || self.any_of.iter().any(|g| matches_all(g, row)))
    }

    /// Ordering by the query's sort keys, for in-process evaluation.
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for key in &self.order {
            let ord = match (column(a, &key.column), column(b, &key.column)) {
                (Some(x), Some(y)) => compare_values(x, y),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            let ord = if key.ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// PostgREST query parameters.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut select = String::from("*");
        for j in &self.joins {
            select.push_str(&format!(",{}:{}!{}(*)", j.alias, j.table, j.local));
        }
        let mut params = vec![("select".to_string(), select)];
        params.extend(self.filters.iter().map(Filter::render_param));
        if !self.any_of.is_empty() {
            let groups: Vec<String> = self
                .any_of
                .iter()
                .map(|g| match g.as_slice() {
                    [single] => single.render_inline(),
                    many => format!(
                        "and({})",
                        many.iter().map(Filter::render_inline).collect::<Vec<_>>().join(",")
                    ),
                })
                .collect();
            params.push(("or".to_string(), format!("({})", groups.join(","))));
        }
        if !self.order.is_empty() {
            let order: Vec<String> = self
                .order
                .iter()
                .map(|o| format!("{}.{}", o.column, if o.ascending { "asc" } else { "desc" }))
                .collect();
            params.push(("order".to_string(), order.join(",")));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            params.push(("offset".to_string(), offset.to_string()));
        }
        params
    }
}

/// Render filters alone (for update/delete requests).
pub fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters.iter().map(Filter::render_param).collect()
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => match (parse_timestamp(x), parse_timestamp(y)) {
            (Ok(tx), Ok(ty)) => tx.cmp(&ty),
            _ => x.cmp(y),
        },
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => scalar_text(a).cmp(&scalar_text(b)),
    }
}

fn quote(value: &Value) -> String {
    let text = scalar_text(value).unwrap_or_else(|| "null".to_string());
    if text.contains([',', '(', ')', ' ', '"']) {
        format!("\"{}\"", text.replace('"', "\\\""))
    } else {
        text
    }
}

fn join_quoted(values: &[Value]) -> String {
    values.iter().map(quote).collect::<Vec<_>>().join(",")
}
