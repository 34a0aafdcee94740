//! Batched inserts of search parameter rows.
//!
//! A writer buffers rows per target table, preparing each table's insert
//! statement the first time a row for it arrives. [`ParameterBatchWriter::push_batch`]
//! executes every non-empty buffer on the writer's connection; the caller's
//! transaction decides whether those rows survive.
//!
//! Two layouts share this machinery:
//!
//! - [`PlainBatchWriter`]: one table per parameter kind, rows discriminated
//!   by `resource_type_id`.
//! - [`ShardedBatchWriter`]: one table per resource type and parameter kind,
//!   rows carrying a `shard_key`.

mod plain;
mod sharded;

pub use plain::PlainBatchWriter;
pub use sharded::{ShardedBatchWriter, encode_shard_key};

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, Statement};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::database::format_timestamp;
use crate::error::IndexResult;
use crate::message::{
    DateParameter, LocationParameter, NumberParameter, ProfileParameter, QuantityParameter,
    ReferenceParameter, StringParameter, TagParameter, TokenParameter,
};

/// Physical layout of the parameter tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVariant {
    /// Shared tables with a resource-type discriminator column.
    #[default]
    Plain,
    /// Per-resource-type tables with a shard key column.
    Sharded,
}

impl SchemaVariant {
    /// Creates a writer for this layout on the given connection.
    pub fn writer<'c>(&self, conn: &'c Connection) -> Box<dyn ParameterBatchWriter + 'c> {
        match self {
            SchemaVariant::Plain => Box::new(PlainBatchWriter::new(conn)),
            SchemaVariant::Sharded => Box::new(ShardedBatchWriter::new(conn)),
        }
    }
}

impl fmt::Display for SchemaVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaVariant::Plain => write!(f, "plain"),
            SchemaVariant::Sharded => write!(f, "sharded"),
        }
    }
}

/// The kinds of search parameter rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParameterKind {
    String,
    Number,
    Date,
    Quantity,
    Location,
    Token,
    Reference,
    Tag,
    Profile,
    Security,
}

impl ParameterKind {
    pub const ALL: [ParameterKind; 10] = [
        ParameterKind::String,
        ParameterKind::Number,
        ParameterKind::Date,
        ParameterKind::Quantity,
        ParameterKind::Location,
        ParameterKind::Token,
        ParameterKind::Reference,
        ParameterKind::Tag,
        ParameterKind::Profile,
        ParameterKind::Security,
    ];

    /// Table name in the plain layout, and the suffix after
    /// `<ResourceType>_` in the sharded layout.
    pub fn table_suffix(&self) -> &'static str {
        match self {
            ParameterKind::String => "str_values",
            ParameterKind::Number => "number_values",
            ParameterKind::Date => "date_values",
            ParameterKind::Quantity => "quantity_values",
            ParameterKind::Location => "latlng_values",
            ParameterKind::Token => "resource_token_refs",
            ParameterKind::Reference => "ref_values",
            ParameterKind::Tag => "tags",
            ParameterKind::Profile => "profiles",
            ParameterKind::Security => "security",
        }
    }

    /// Kind-specific value columns and their SQL types, in insert order.
    pub fn value_columns(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            ParameterKind::String => &[("str_value", "TEXT"), ("str_value_lcase", "TEXT")],
            ParameterKind::Number => &[
                ("number_value", "REAL"),
                ("number_value_low", "REAL"),
                ("number_value_high", "REAL"),
            ],
            ParameterKind::Date => &[("date_start", "TEXT"), ("date_end", "TEXT")],
            ParameterKind::Quantity => &[
                ("code", "TEXT"),
                ("code_system_id", "INTEGER"),
                ("quantity_value", "REAL"),
                ("quantity_value_low", "REAL"),
                ("quantity_value_high", "REAL"),
            ],
            ParameterKind::Location => {
                &[("latitude_value", "REAL"), ("longitude_value", "REAL")]
            }
            ParameterKind::Token => &[
                ("common_token_value_id", "INTEGER"),
                ("ref_version_id", "INTEGER"),
            ],
            ParameterKind::Reference => &[
                ("ref_logical_resource_id", "INTEGER"),
                ("ref_version_id", "INTEGER"),
            ],
            ParameterKind::Tag | ParameterKind::Security => {
                &[("common_token_value_id", "INTEGER")]
            }
            ParameterKind::Profile => &[
                ("canonical_id", "INTEGER"),
                ("version", "TEXT"),
                ("fragment", "TEXT"),
            ],
        }
    }
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_suffix())
    }
}

/// The logical resource a row belongs to.
#[derive(Debug, Clone, Copy)]
pub struct RowTarget<'a> {
    pub resource_type: &'a str,
    pub resource_type_id: i64,
    pub logical_resource_id: i64,
    pub shard_key: i16,
}

/// One executed batch statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedBatch {
    pub table: String,
    pub kind: ParameterKind,
    pub rows: usize,
}

/// What a call to `push_batch` executed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub batches: Vec<ExecutedBatch>,
}

impl BatchSummary {
    /// Number of batch statements executed.
    pub fn statement_count(&self) -> usize {
        self.batches.len()
    }

    pub fn row_count(&self) -> usize {
        self.batches.iter().map(|b| b.rows).sum()
    }

    /// Rows executed for one parameter kind across all tables.
    pub fn rows_for(&self, kind: ParameterKind) -> usize {
        self.batches
            .iter()
            .filter(|b| b.kind == kind)
            .map(|b| b.rows)
            .sum()
    }
}

/// Buffers typed parameter rows and flushes them as batched inserts.
///
/// Callers must not add the same logical row twice without rolling back in
/// between; the writer does no deduplication.
pub trait ParameterBatchWriter {
    /// Buffers one row. `values` are the kind's [`ParameterKind::value_columns`].
    fn append(
        &mut self,
        kind: ParameterKind,
        target: &RowTarget<'_>,
        parameter_name_id: i64,
        composite_id: Option<i32>,
        values: Vec<Value>,
    ) -> IndexResult<()>;

    /// Deletes every existing parameter row of the target logical resource.
    fn purge(&mut self, target: &RowTarget<'_>) -> IndexResult<()>;

    /// Rows buffered for `kind` since the last push.
    fn pending(&self, kind: ParameterKind) -> usize;

    /// Executes every non-empty buffer and resets the counters.
    fn push_batch(&mut self) -> IndexResult<BatchSummary>;

    /// Releases all prepared statements and drops buffered rows. Safe to call
    /// more than once.
    fn close(&mut self);

    fn add_string(
        &mut self,
        target: &RowTarget<'_>,
        parameter_name_id: i64,
        param: &StringParameter,
    ) -> IndexResult<()> {
        let lcase = param.value.as_deref().map(normalize_string);
        self.append(
            ParameterKind::String,
            target,
            parameter_name_id,
            param.composite_id,
            vec![text(param.value.as_deref()), text(lcase.as_deref())],
        )
    }

    fn add_number(
        &mut self,
        target: &RowTarget<'_>,
        parameter_name_id: i64,
        param: &NumberParameter,
    ) -> IndexResult<()> {
        self.append(
            ParameterKind::Number,
            target,
            parameter_name_id,
            param.composite_id,
            vec![
                real(param.value),
                real(param.value_low),
                real(param.value_high),
            ],
        )
    }

    fn add_date(
        &mut self,
        target: &RowTarget<'_>,
        parameter_name_id: i64,
        param: &DateParameter,
    ) -> IndexResult<()> {
        self.append(
            ParameterKind::Date,
            target,
            parameter_name_id,
            param.composite_id,
            vec![
                timestamp(param.value_date_start.as_ref()),
                timestamp(param.value_date_end.as_ref()),
            ],
        )
    }

    fn add_quantity(
        &mut self,
        target: &RowTarget<'_>,
        parameter_name_id: i64,
        code_system_id: Option<i64>,
        param: &QuantityParameter,
    ) -> IndexResult<()> {
        self.append(
            ParameterKind::Quantity,
            target,
            parameter_name_id,
            param.composite_id,
            vec![
                text(param.value_code.as_deref()),
                integer(code_system_id),
                real(param.value_number),
                real(param.value_number_low),
                real(param.value_number_high),
            ],
        )
    }

    fn add_location(
        &mut self,
        target: &RowTarget<'_>,
        parameter_name_id: i64,
        param: &LocationParameter,
    ) -> IndexResult<()> {
        self.append(
            ParameterKind::Location,
            target,
            parameter_name_id,
            param.composite_id,
            vec![
                param.value_latitude.map_or(Value::Null, Value::Real),
                param.value_longitude.map_or(Value::Null, Value::Real),
            ],
        )
    }

    fn add_token(
        &mut self,
        target: &RowTarget<'_>,
        parameter_name_id: i64,
        common_token_value_id: i64,
        param: &TokenParameter,
    ) -> IndexResult<()> {
        self.append(
            ParameterKind::Token,
            target,
            parameter_name_id,
            param.composite_id,
            vec![
                Value::Integer(common_token_value_id),
                integer(param.ref_version_id.map(i64::from)),
            ],
        )
    }

    fn add_reference(
        &mut self,
        target: &RowTarget<'_>,
        parameter_name_id: i64,
        ref_logical_resource_id: i64,
        param: &ReferenceParameter,
    ) -> IndexResult<()> {
        self.append(
            ParameterKind::Reference,
            target,
            parameter_name_id,
            param.composite_id,
            vec![
                Value::Integer(ref_logical_resource_id),
                integer(param.ref_version_id.map(i64::from)),
            ],
        )
    }

    fn add_tag(
        &mut self,
        target: &RowTarget<'_>,
        parameter_name_id: i64,
        common_token_value_id: i64,
        _param: &TagParameter,
    ) -> IndexResult<()> {
        self.append(
            ParameterKind::Tag,
            target,
            parameter_name_id,
            None,
            vec![Value::Integer(common_token_value_id)],
        )
    }

    fn add_profile(
        &mut self,
        target: &RowTarget<'_>,
        parameter_name_id: i64,
        canonical_id: i64,
        param: &ProfileParameter,
    ) -> IndexResult<()> {
        self.append(
            ParameterKind::Profile,
            target,
            parameter_name_id,
            None,
            vec![
                Value::Integer(canonical_id),
                text(param.profile_version.as_deref()),
                text(param.fragment.as_deref()),
            ],
        )
    }

    fn add_security(
        &mut self,
        target: &RowTarget<'_>,
        parameter_name_id: i64,
        common_token_value_id: i64,
        _param: &TagParameter,
    ) -> IndexResult<()> {
        self.append(
            ParameterKind::Security,
            target,
            parameter_name_id,
            None,
            vec![Value::Integer(common_token_value_id)],
        )
    }
}

/// Lower-cased, whitespace-collapsed form used for case-insensitive string search.
pub fn normalize_string(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |v| Value::Text(v.to_string()))
}

fn integer(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

fn real(value: Option<Decimal>) -> Value {
    value
        .and_then(|d| d.to_f64())
        .map_or(Value::Null, Value::Real)
}

fn timestamp(value: Option<&DateTime<Utc>>) -> Value {
    value.map_or(Value::Null, |v| Value::Text(format_timestamp(v)))
}

/// Buffered rows for one table plus its lazily prepared insert.
struct PendingBatch<'c> {
    kind: ParameterKind,
    statement: Statement<'c>,
    rows: Vec<Vec<Value>>,
}

/// Registry of per-table insert statements shared by both layouts.
struct StatementRegistry<'c> {
    conn: &'c Connection,
    /// `resource_type_id` (plain) or `shard_key` (sharded).
    discriminator: &'static str,
    batches: BTreeMap<String, PendingBatch<'c>>,
}

impl<'c> StatementRegistry<'c> {
    fn new(conn: &'c Connection, discriminator: &'static str) -> Self {
        Self {
            conn,
            discriminator,
            batches: BTreeMap::new(),
        }
    }

    fn append(&mut self, kind: ParameterKind, table: String, row: Vec<Value>) -> IndexResult<()> {
        let batch = match self.batches.entry(table) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let sql = insert_sql(entry.key(), self.discriminator, kind);
                debug!(table = %entry.key(), "Preparing batch insert");
                let statement = self.conn.prepare(&sql)?;
                entry.insert(PendingBatch {
                    kind,
                    statement,
                    rows: Vec::new(),
                })
            }
        };
        batch.rows.push(row);
        Ok(())
    }

    fn pending(&self, kind: ParameterKind) -> usize {
        self.batches
            .values()
            .filter(|b| b.kind == kind)
            .map(|b| b.rows.len())
            .sum()
    }

    fn push_batch(&mut self) -> IndexResult<BatchSummary> {
        let mut summary = BatchSummary::default();
        for (table, batch) in self.batches.iter_mut() {
            if batch.rows.is_empty() {
                continue;
            }
            let rows = std::mem::take(&mut batch.rows);
            for row in &rows {
                batch.statement.execute(rusqlite::params_from_iter(row.iter()))?;
            }
            summary.batches.push(ExecutedBatch {
                table: table.clone(),
                kind: batch.kind,
                rows: rows.len(),
            });
        }
        Ok(summary)
    }

    fn close(&mut self) {
        // Dropping a statement finalizes it.
        self.batches.clear();
    }
}

fn insert_sql(table: &str, discriminator: &str, kind: ParameterKind) -> String {
    let mut columns = vec![discriminator, "parameter_name_id", "logical_resource_id"];
    columns.extend(kind.value_columns().iter().map(|(name, _)| *name));
    columns.push("composite_id");
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders.join(", ")
    )
}
