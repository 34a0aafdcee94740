use rusqlite::Connection;
use rusqlite::types::Value;

use super::{BatchSummary, ParameterBatchWriter, ParameterKind, RowTarget, StatementRegistry};
use crate::error::IndexResult;

/// Writer for the sharded layout: `<ResourceType>_<kind>` tables carrying a
/// shard key, so a distributed database can co-locate all rows of one
/// logical resource.
pub struct ShardedBatchWriter<'c> {
    conn: &'c Connection,
    registry: StatementRegistry<'c>,
}

impl<'c> ShardedBatchWriter<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            registry: StatementRegistry::new(conn, "shard_key"),
        }
    }
}

fn table_name(resource_type: &str, kind: ParameterKind) -> String {
    format!("{}_{}", resource_type, kind.table_suffix())
}

impl ParameterBatchWriter for ShardedBatchWriter<'_> {
    fn append(
        &mut self,
        kind: ParameterKind,
        target: &RowTarget<'_>,
        parameter_name_id: i64,
        composite_id: Option<i32>,
        values: Vec<Value>,
    ) -> IndexResult<()> {
        let mut row = Vec::with_capacity(values.len() + 4);
        row.push(Value::Integer(target.shard_key.into()));
        row.push(Value::Integer(parameter_name_id));
        row.push(Value::Integer(target.logical_resource_id));
        row.extend(values);
        row.push(composite_id.map_or(Value::Null, |id| Value::Integer(id.into())));
        self.registry
            .append(kind, table_name(target.resource_type, kind), row)
    }

    // Not keyed on the shard: an earlier version may have been routed by a
    // different requestShard.
    fn purge(&mut self, target: &RowTarget<'_>) -> IndexResult<()> {
        for kind in ParameterKind::ALL {
            let sql = format!(
                "DELETE FROM {} WHERE logical_resource_id = ?1",
                table_name(target.resource_type, kind)
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

impl Drop for ShardedBatchWriter<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Stable 16-bit shard key for a routing value (FNV-1a, folded).
pub fn encode_shard_key(routing_value: &str) -> i16 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in routing_value.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    ((hash >> 16) ^ (hash & 0xffff)) as u16 as i16
}
