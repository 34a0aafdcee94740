use rusqlite::Connection;
use rusqlite::types::Value;

use super::{BatchSummary, ParameterBatchWriter, ParameterKind, RowTarget, StatementRegistry};
use crate::error::IndexResult;

/// Writer for the plain layout: one shared table per parameter kind.
pub struct PlainBatchWriter<'c> {
    conn: &'c Connection,
    registry: StatementRegistry<'c>,
}

impl<'c> PlainBatchWriter<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            registry: StatementRegistry::new(conn, "resource_type_id"),
        }
    }
}

impl ParameterBatchWriter for PlainBatchWriter<'_> {
    fn append(
        &mut self,
        kind: ParameterKind,
        target: &RowTarget<'_>,
        parameter_name_id: i64,
        composite_id: Option<i32>,
        values: Vec<Value>,
    ) -> IndexResult<()> {
        let mut row = Vec::with_capacity(values.len() + 4);
        row.push(Value::Integer(target.resource_type_id));
        row.push(Value::Integer(parameter_name_id));
        row.push(Value::Integer(target.logical_resource_id));
        row.extend(values);
        row.push(composite_id.map_or(Value::Null, |id| Value::Integer(id.into())));
        self.registry
            .append(kind, kind.table_suffix().to_string(), row)
    }

    fn purge(&mut self, target: &RowTarget<'_>) -> IndexResult<()> {
        for kind in ParameterKind::ALL {
            let sql = format!(
                "DELETE FROM {} WHERE logical_resource_id = ?1",
                kind.table_suffix()
            );
            self.conn
                .prepare_cached(&sql)?
                .execute([target.logical_resource_id])?;
        }
        Ok(())
    }

    fn pending(&self, kind: ParameterKind) -> usize {
        self.registry.pending(kind)
    }

    fn push_batch(&mut self) -> IndexResult<BatchSummary> {
        self.registry.push_batch()
    }

    fn close(&mut self) {
        self.registry.close();
    }
}

impl Drop for PlainBatchWriter<'_> {
    fn drop(&mut self) {
        self.close();
    }
}
