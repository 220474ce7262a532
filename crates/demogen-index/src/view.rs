//! Analytic (semantic) views over structured tables.
//!
//! A view names a base table, many-to-one relationships out of it, and the
//! business-level dimensions and metrics (with synonyms) a consumer may ask
//! for. Definitions are validated against the warehouse when created; queries
//! join, filter and aggregate at read time.

use demogen_storage::{Table, Warehouse};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::ViewDefinitionError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalTable {
    pub alias: String,
    pub table: String,
}

/// `from.column` references `to.column`; each `from` row joins at most one `to` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub from: String,
    pub from_column: String,
    pub to: String,
    pub to_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub table: String,
    pub column: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub table: String,
    pub column: String,
    pub aggregation: Aggregation,
    #[serde(default)]
    pub synonyms: Vec<String>,
}

/// The first entry in `tables` is the base (fact) table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticViewDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tables: Vec<LogicalTable>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    pub dimensions: Vec<Dimension>,
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewQuery {
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    /// Dimension name (or synonym) → required value, compared case-insensitively.
    #[serde(default)]
    pub filters: Vec<(String, String)>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ViewResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().filter_map(|r| r.get(idx)).collect())
    }
}

enum Field<'a> {
    Dimension(&'a Dimension),
    Metric(&'a Metric),
}

impl AnalyticViewDef {
    fn base(&self) -> Result<&LogicalTable, ViewDefinitionError> {
        self.tables.first().ok_or_else(|| ViewDefinitionError::NoTables {
            view: self.name.clone(),
        })
    }

    fn physical(&self, alias: &str) -> Result<&str, ViewDefinitionError> {
        self.tables
            .iter()
            .find(|t| t.alias == alias)
            .map(|t| t.table.as_str())
            .ok_or_else(|| ViewDefinitionError::UnknownAlias {
                view: self.name.clone(),
                alias: alias.to_string(),
            })
    }

    /// Relationships in join order: each one's `from` is already resolved.
    fn join_order(&self) -> Result<Vec<&Relationship>, ViewDefinitionError> {
        let base = self.base()?;
        let mut resolved: BTreeSet<&str> = BTreeSet::from([base.alias.as_str()]);
        let mut ordered = Vec::new();
        let mut pending: Vec<&Relationship> = self.relationships.iter().collect();
        loop {
            let before = pending.len();
            pending.retain(|r| {
                let rel: &Relationship = *r;
                if resolved.contains(rel.from.as_str()) {
                    resolved.insert(rel.to.as_str());
                    ordered.push(rel);
                    false
                } else {
                    true
                }
            });
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }
        if let Some(t) = self
            .tables
            .iter()
            .find(|t| !resolved.contains(t.alias.as_str()))
        {
            return Err(ViewDefinitionError::Unreachable {
                view: self.name.clone(),
                alias: t.alias.clone(),
                base: base.alias.clone(),
            });
        }
        Ok(ordered)
    }

    /// Check every table, column, relationship and name against `warehouse`.
    pub fn validate(&self, warehouse: &Warehouse) -> Result<(), ViewDefinitionError> {
        self.base()?;
        if self.metrics.is_empty() {
            return Err(ViewDefinitionError::NoMetrics {
                view: self.name.clone(),
            });
        }

        let mut columns: HashMap<&str, Vec<String>> = HashMap::new();
        for t in &self.tables {
            let table = warehouse
                .table(&t.table)
                .map_err(|_| ViewDefinitionError::UnknownTable {
                    view: self.name.clone(),
                    table: t.table.clone(),
                })?;
            if columns.insert(t.alias.as_str(), table.columns).is_some() {
                return Err(ViewDefinitionError::DuplicateName {
                    view: self.name.clone(),
                    name: t.alias.clone(),
                });
            }
        }

        let check = |alias: &str, column: &str| -> Result<(), ViewDefinitionError> {
            let table = self.physical(alias)?;
            let known = columns.get(alias).is_some_and(|cols| cols.iter().any(|c| c == column));
            if known {
                Ok(())
            } else {
                Err(ViewDefinitionError::UnknownColumn {
                    view: self.name.clone(),
                    table: table.to_string(),
                    column: column.to_string(),
                })
            }
        };
        for r in &self.relationships {
            check(&r.from, &r.from_column)?;
            check(&r.to, &r.to_column)?;
        }
        for d in &self.dimensions {
            check(&d.table, &d.column)?;
        }
        for m in &self.metrics {
            check(&m.table, &m.column)?;
        }
        self.join_order()?;

        let mut names: BTreeSet<String> = BTreeSet::new();
        let all_names = self
            .dimensions
            .iter()
            .flat_map(|d| std::iter::once(&d.name).chain(&d.synonyms))
            .chain(
                self.metrics
                    .iter()
                    .flat_map(|m| std::iter::once(&m.name).chain(&m.synonyms)),
            );
        for name in all_names {
            if !names.insert(name.to_lowercase()) {
                return Err(ViewDefinitionError::DuplicateName {
                    view: self.name.clone(),
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<Field<'_>, ViewDefinitionError> {
        let matches = |n: &String, syn: &[String]| {
            n.eq_ignore_ascii_case(name) || syn.iter().any(|s| s.eq_ignore_ascii_case(name))
        };
        if let Some(d) = self.dimensions.iter().find(|d| matches(&d.name, &d.synonyms)) {
            return Ok(Field::Dimension(d));
        }
        if let Some(m) = self.metrics.iter().find(|m| matches(&m.name, &m.synonyms)) {
            return Ok(Field::Metric(m));
        }
        Err(ViewDefinitionError::UnknownField {
            view: self.name.clone(),
            name: name.to_string(),
        })
    }

    fn resolve_dimension(&self, name: &str) -> Result<&Dimension, ViewDefinitionError> {
        match self.resolve(name)? {
            Field::Dimension(d) => Ok(d),
            Field::Metric(_) => Err(ViewDefinitionError::UnknownField {
                view: self.name.clone(),
                name: name.to_string(),
            }),
        }
    }

    fn resolve_metric(&self, name: &str) -> Result<&Metric, ViewDefinitionError> {
        match self.resolve(name)? {
            Field::Metric(m) => Ok(m),
            Field::Dimension(_) => Err(ViewDefinitionError::UnknownField {
                view: self.name.clone(),
                name: name.to_string(),
            }),
        }
    }

    /// Join, filter, group by the requested dimensions and aggregate metrics.
    /// `tables` maps alias → loaded table.
    pub fn execute(
        &self,
        tables: &HashMap<String, Table>,
        query: &ViewQuery,
    ) -> Result<ViewResult, ViewDefinitionError> {
        let base = self.base()?;
        let dims: Vec<&Dimension> = query
            .dimensions
            .iter()
            .map(|n| self.resolve_dimension(n))
            .collect::<Result<_, _>>()?;
        let metrics: Vec<&Metric> = query
            .metrics
            .iter()
            .map(|n| self.resolve_metric(n))
            .collect::<Result<_, _>>()?;
        let filters: Vec<(&Dimension, String)> = query
            .filters
            .iter()
            .map(|(n, v)| -> Result<_, ViewDefinitionError> {
                Ok((self.resolve_dimension(n)?, v.to_lowercase()))
            })
            .collect::<Result<_, _>>()?;
        let joins = self.join_order()?;

        let table_for = |alias: &str| -> Result<&Table, ViewDefinitionError> {
            tables.get(alias).ok_or_else(|| ViewDefinitionError::UnknownAlias {
                view: self.name.clone(),
                alias: alias.to_string(),
            })
        };

        // to-alias → key → row
        let mut lookups: Vec<HashMap<String, &Map<String, Value>>> = Vec::with_capacity(joins.len());
        for r in &joins {
            let target = table_for(&r.to)?;
            lookups.push(
                target
                    .rows
                    .iter()
                    .filter_map(|row| key_of(row.get(&r.to_column)).map(|k| (k, row)))
                    .collect(),
            );
        }

        let mut groups: BTreeMap<Vec<String>, (Vec<Value>, Vec<Accumulator>)> = BTreeMap::new();
        for base_row in &table_for(&base.alias)?.rows {
            let mut joined: HashMap<&str, &Map<String, Value>> = HashMap::new();
            joined.insert(base.alias.as_str(), base_row);
            for (r, lookup) in joins.iter().zip(&lookups) {
                let target = joined
                    .get(r.from.as_str())
                    .and_then(|row| key_of(row.get(&r.from_column)))
                    .and_then(|k| lookup.get(&k).copied());
                if let Some(row) = target {
                    joined.insert(r.to.as_str(), row);
                }
            }
            let value_of = |table: &str, column: &str| -> Value {
                joined
                    .get(table)
                    .and_then(|row| row.get(column))
                    .cloned()
                    .unwrap_or(Value::Null)
            };

            let keep = filters.iter().all(|(d, wanted)| {
                key_of(Some(&value_of(&d.table, &d.column)))
                    .is_some_and(|v| v.to_lowercase() == *wanted)
            });
            if !keep {
                continue;
            }

            let dim_values: Vec<Value> = dims.iter().map(|d| value_of(&d.table, &d.column)).collect();
            let group_key: Vec<String> = dim_values
                .iter()
                .map(|v| key_of(Some(v)).unwrap_or_default())
                .collect();
            let entry = groups.entry(group_key).or_insert_with(|| {
                (
                    dim_values.clone(),
                    metrics.iter().map(|m| Accumulator::new(m.aggregation)).collect(),
                )
            });
            for (acc, m) in entry.1.iter_mut().zip(&metrics) {
                acc.add(&value_of(&m.table, &m.column));
            }
        }

        let mut columns: Vec<String> = dims.iter().map(|d| d.name.clone()).collect();
        columns.extend(metrics.iter().map(|m| m.name.clone()));
        let mut rows: Vec<Vec<Value>> = groups
            .into_values()
            .map(|(mut values, accs)| {
                values.extend(accs.iter().map(Accumulator::finish));
                values
            })
            .collect();
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(ViewResult { columns, rows })
    }
}

fn key_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Clone)]
struct Accumulator {
    aggregation: Aggregation,
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl Accumulator {
    fn new(aggregation: Aggregation) -> Self {
        Self {
            aggregation,
            count: 0,
            sum: 0.0,
            min: None,
            max: None,
        }
    }

    fn add(&mut self, value: &Value) {
        if value.is_null() {
            return;
        }
        self.count += 1;
        if let Some(v) = value.as_f64() {
            self.sum += v;
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }

    fn finish(&self) -> Value {
        let number = |v: f64| {
            serde_json::Number::from_f64((v * 10_000.0).round() / 10_000.0)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        };
        match self.aggregation {
            Aggregation::Count => Value::from(self.count),
            Aggregation::Sum => number(self.sum),
            Aggregation::Avg if self.count > 0 => number(self.sum / self.count as f64),
            Aggregation::Avg => Value::Null,
            Aggregation::Min => self.min.map(number).unwrap_or(Value::Null),
            Aggregation::Max => self.max.map(number).unwrap_or(Value::Null),
        }
    }
}
