//! Message handler: readiness protocol and transaction lifecycle.
//!
//! A handler owns one database connection for its whole life. For each
//! collected batch it:
//!
//! 1. decodes payloads and drops messages that can never apply,
//! 2. keeps only the latest version per logical resource,
//! 3. in one `BEGIN IMMEDIATE` transaction, reads primary-store snapshots,
//!    applies the ready messages (replacing any earlier rows for the same
//!    logical resource), then commits,
//! 4. publishes dictionary ids created by that transaction to the shared
//!    cache, strictly after the commit,
//! 5. retries still-waiting messages until the wait bound, then applies the
//!    configured [`WaitTimeoutPolicy`].

pub mod readiness;
pub mod resolver;

use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::batch::{BatchSummary, ParameterBatchWriter, RowTarget, SchemaVariant, encode_shard_key};
use crate::cache::{CommonTokenValueKey, DictionaryKey, IdentityCache, LogicalResourceIdentKey};
use crate::database::DbConnection;
use crate::database::schema::is_valid_resource_type;
use crate::error::{IndexError, IndexResult, MessageError};
use crate::message::{DEFAULT_TOKEN_SYSTEM, IndexMessage, parse_message};

pub use readiness::{LogicalResourceSnapshot, Readiness, ReadinessReport, StaleReason, classify};
pub use resolver::{IdentityResolver, TransactionIdentities};

/// What happens to messages still waiting when the wait bound expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WaitTimeoutPolicy {
    /// Log and drop them; the batch offsets are committed.
    #[default]
    Drop,
    /// Fail the batch; offsets are not committed and the consumer stops.
    Fail,
}

/// Handler settings.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub schema_variant: SchemaVariant,
    pub max_ready_wait: Duration,
    pub ready_retry_interval: Duration,
    pub wait_timeout_policy: WaitTimeoutPolicy,
    /// When set, messages from other server instances are ignored.
    pub instance_identifier: Option<String>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            schema_variant: SchemaVariant::Plain,
            max_ready_wait: Duration::from_secs(5),
            ready_retry_interval: Duration::from_millis(250),
            wait_timeout_policy: WaitTimeoutPolicy::Drop,
            instance_identifier: None,
        }
    }
}

/// Counts for one handled batch. Every received message lands in exactly
/// one of the final-state counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub received: usize,
    /// Produced by another server instance.
    pub ignored: usize,
    /// Undecodable, unsupported version, or unknown resource type.
    pub rejected: usize,
    pub applied: usize,
    pub stale: usize,
    /// Still waiting at the wait bound and dropped.
    pub dropped: usize,
    /// Parameter rows inserted.
    pub rows: usize,
    pub transactions: usize,
}

impl BatchOutcome {
    fn absorb(&mut self, other: &BatchOutcome) {
        self.received += other.received;
        self.ignored += other.ignored;
        self.rejected += other.rejected;
        self.applied += other.applied;
        self.stale += other.stale;
        self.dropped += other.dropped;
        self.rows += other.rows;
        self.transactions += other.transactions;
    }
}

/// Applies index messages on a single connection.
pub struct MessageHandler {
    conn: DbConnection,
    cache: Arc<IdentityCache>,
    options: HandlerOptions,
    identities: TransactionIdentities,
    in_transaction: bool,
    rollback_only: bool,
}

impl MessageHandler {
    pub fn new(conn: DbConnection, cache: Arc<IdentityCache>, options: HandlerOptions) -> Self {
        Self {
            conn,
            cache,
            options,
            identities: TransactionIdentities::default(),
            in_transaction: false,
            rollback_only: false,
        }
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    /// Ids created by the open transaction and not yet published.
    pub fn staged_identities(&self) -> usize {
        self.identities.staged().len()
    }

    /// Decodes raw payloads and processes the resulting messages.
    pub fn handle(&mut self, payloads: &[String]) -> IndexResult<BatchOutcome> {
        let mut outcome = BatchOutcome {
            received: payloads.len(),
            ..Default::default()
        };
        let mut messages = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match parse_message(payload) {
                Ok(envelope) => {
                    let foreign = match &self.options.instance_identifier {
                        Some(expected) => envelope.instance_identifier.as_deref() != Some(expected.as_str()),
                        None => false,
                    };
                    if foreign {
                        debug!(instance = ?envelope.instance_identifier, "Ignoring message from another instance");
                        outcome.ignored += 1;
                        continue;
                    }
                    messages.push(envelope.data);
                }
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable index message");
                    outcome.rejected += 1;
                }
            }
        }

        let mut processed = self.process_messages(messages)?;
        processed.received = 0;
        outcome.absorb(&processed);
        Ok(outcome)
    }

    /// Runs the readiness protocol over decoded messages until every message
    /// is applied, stale, or past the wait bound.
    pub fn process_messages(&mut self, messages: Vec<IndexMessage>) -> IndexResult<BatchOutcome> {
        let mut outcome = BatchOutcome {
            received: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            return Ok(outcome);
        }

        let (latest, superseded) = readiness::latest_versions(messages);
        for message in &superseded {
            debug!(
                resource = %message.resource_type,
                logical_resource_id = message.logical_resource_id,
                version = message.version_id,
                "Superseded by a later version in the same batch"
            );
        }
        outcome.stale += superseded.len();

        let mut pending = Vec::with_capacity(latest.len());
        for message in latest {
            if self.lookup_resource_type(&message.resource_type)? {
                pending.push(message);
            } else {
                warn!(resource = %message.resource_type, logical_id = %message.logical_id, "Rejecting message for unknown resource type");
                outcome.rejected += 1;
            }
        }

        let started = Instant::now();
        while !pending.is_empty() {
            outcome.transactions += 1;
            let report = match self.run_transaction(pending.clone()) {
                Ok(report) => report,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    warn!(
                        error = %e,
                        messages = pending.len(),
                        "Index transaction failed; applying messages one at a time"
                    );
                    self.isolate_failures(pending, &mut outcome)?
                }
            };
            outcome.applied += report.applied;
            outcome.rows += report.rows;
            outcome.stale += report.stale;
            pending = report.waiting;

            if pending.is_empty() {
                break;
            }

            let waited = started.elapsed();
            if waited >= self.options.max_ready_wait {
                match self.options.wait_timeout_policy {
                    WaitTimeoutPolicy::Drop => {
                        for message in &pending {
                            warn!(
                                resource = %message.resource_type,
                                logical_id = %message.logical_id,
                                version = message.version_id,
                                waited_ms = waited.as_millis() as u64,
                                "Dropping index message that never became visible"
                            );
                        }
                        outcome.dropped += pending.len();
                        break;
                    }
                    WaitTimeoutPolicy::Fail => {
                        return Err(IndexError::WaitTimeout {
                            waiting: pending.len(),
                            waited,
                        });
                    }
                }
            }

            let remaining = self.options.max_ready_wait.saturating_sub(waited);
            std::thread::sleep(self.options.ready_retry_interval.min(remaining));
        }

        info!(
            applied = outcome.applied,
            stale = outcome.stale,
            dropped = outcome.dropped,
            rejected = outcome.rejected,
            rows = outcome.rows,
            "Index batch processed"
        );
        Ok(outcome)
    }

    /// Checks and applies one round inside a single transaction.
    fn run_transaction(&mut self, messages: Vec<IndexMessage>) -> IndexResult<RoundReport> {
        self.begin_transaction()?;
        let result = self.check_and_apply(messages);
        if result.is_err() {
            self.set_rollback_only();
        }
        match (result, self.end_transaction()) {
            (Ok(report), Ok(())) => Ok(report),
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
        }
    }

    /// Retries each message in its own transaction so a message that can
    /// never be applied is rejected without holding back the others.
    /// Transient errors still fail the whole batch.
    fn isolate_failures(
        &mut self,
        messages: Vec<IndexMessage>,
        outcome: &mut BatchOutcome,
    ) -> IndexResult<RoundReport> {
        let mut combined = RoundReport::default();
        for message in messages {
            let resource_type = message.resource_type.clone();
            let logical_id = message.logical_id.clone();
            let version = message.version_id;
            outcome.transactions += 1;
            match self.run_transaction(vec![message]) {
                Ok(report) => {
                    combined.applied += report.applied;
                    combined.stale += report.stale;
                    combined.rows += report.rows;
                    combined.waiting.extend(report.waiting);
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    error!(
                        resource = %resource_type,
                        logical_id = %logical_id,
                        version,
                        error = %e,
                        "Rejecting index message that cannot be applied"
                    );
                    outcome.rejected += 1;
                }
            }
        }
        Ok(combined)
    }

    fn check_and_apply(&mut self, messages: Vec<IndexMessage>) -> IndexResult<RoundReport> {
        let report = self.check_ready(messages)?;
        for (message, reason) in &report.stale {
            match reason {
                StaleReason::Uncommitted => warn!(
                    resource = %message.resource_type,
                    logical_id = %message.logical_id,
                    version = message.version_id,
                    "Version matches but hash or timestamp differ; message belongs to a transaction that did not commit"
                ),
                StaleReason::Superseded { current_version } => debug!(
                    resource = %message.resource_type,
                    logical_id = %message.logical_id,
                    version = message.version_id,
                    current_version,
                    "Skipping stale index message"
                ),
                StaleReason::Duplicate => {}
            }
        }

        let summary = if report.ready.is_empty() {
            BatchSummary::default()
        } else {
            self.apply_ready(&report.ready)?
        };
        Ok(RoundReport {
            applied: report.ready.len(),
            stale: report.stale.len(),
            rows: summary.row_count(),
            waiting: report.waiting,
        })
    }

    /// Classifies messages against the primary store on this handler's
    /// connection (inside the open transaction, if any).
    pub fn check_ready(&self, messages: Vec<IndexMessage>) -> IndexResult<ReadinessReport> {
        readiness::check_ready(&self.conn, messages)
    }

    /// Writes the parameter rows of ready messages: resolves dictionary ids,
    /// deletes existing rows of each logical resource, buffers the new rows
    /// and flushes them. Must run inside a transaction.
    pub fn apply_ready(&mut self, ready: &[IndexMessage]) -> IndexResult<BatchSummary> {
        let conn: &Connection = &self.conn;
        let variant = self.options.schema_variant;
        let mut resolver = IdentityResolver::new(conn, &self.cache, &mut self.identities);

        let mut targets = Vec::with_capacity(ready.len());
        for message in ready {
            let resource_type_id = resolver
                .resource_type_id(&message.resource_type)?
                .ok_or_else(|| MessageError::UnknownResourceType {
                    resource_type: message.resource_type.clone(),
                })?;
            let shard_key = match variant {
                SchemaVariant::Plain => 0,
                SchemaVariant::Sharded => encode_shard_key(&message.routing_value()),
            };
            let target = RowTarget {
                resource_type: &message.resource_type,
                resource_type_id,
                logical_resource_id: message.logical_resource_id,
                shard_key,
            };
            note_identities(&mut resolver, message, &target)?;
            targets.push(target);
        }
        resolver.resolve()?;

        let mut writer = variant.writer(conn);
        for (message, target) in ready.iter().zip(&targets) {
            writer.purge(target)?;
            write_parameters(writer.as_mut(), &resolver, message, target)?;
        }
        let summary = writer.push_batch()?;
        writer.close();
        debug!(statements = summary.statement_count(), rows = summary.row_count(), "Parameter batch flushed");
        Ok(summary)
    }

    /// Starts a write transaction.
    pub fn begin_transaction(&mut self) -> IndexResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction = true;
        self.rollback_only = false;
        Ok(())
    }

    /// Marks the open transaction so `end_transaction` rolls it back.
    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    /// Commits (then publishes staged ids) or rolls back the open
    /// transaction. A failed rollback is logged and swallowed. The
    /// transaction's working maps are cleared either way.
    pub fn end_transaction(&mut self) -> IndexResult<()> {
        let result = if !self.in_transaction {
            Ok(())
        } else if self.rollback_only {
            self.rollback();
            Ok(())
        } else {
            match self.conn.execute_batch("COMMIT") {
                Ok(()) => {
                    self.publish_staged();
                    Ok(())
                }
                Err(e) => {
                    error!(error = %e, "Commit failed");
                    self.rollback();
                    Err(e.into())
                }
            }
        };
        self.in_transaction = false;
        self.rollback_only = false;
        self.identities.clear();
        result
    }

    /// Rolls back any open transaction and drops per-transaction state.
    pub fn close(&mut self) {
        if self.in_transaction {
            self.rollback();
            self.in_transaction = false;
        }
        self.identities.clear();
    }

    fn rollback(&mut self) {
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            error!(error = %e, "Rollback failed; connection may be unusable");
        }
    }

    fn publish_staged(&mut self) {
        let staged = self.identities.take_staged();
        if !staged.is_empty() {
            debug!(count = staged.len(), "Publishing committed dictionary ids");
        }
        for (key, id) in staged {
            self.cache.put(key, id);
        }
    }

    fn lookup_resource_type(&mut self, resource_type: &str) -> IndexResult<bool> {
        if !is_valid_resource_type(resource_type) {
            return Ok(false);
        }
        let conn: &Connection = &self.conn;
        let mut identities = TransactionIdentities::default();
        let mut resolver = IdentityResolver::new(conn, &self.cache, &mut identities);
        let known = resolver.resource_type_id(resource_type)?.is_some();
        // A committed dictionary row; safe to publish immediately.
        for (key, id) in identities.take_staged() {
            self.cache.put(key, id);
        }
        Ok(known)
    }
}

impl Drop for MessageHandler {
    fn drop(&mut self) {
        if self.in_transaction {
            self.rollback();
        }
    }
}

#[derive(Default)]
struct RoundReport {
    applied: usize,
    stale: usize,
    rows: usize,
    waiting: Vec<IndexMessage>,
}

fn token_key(target: &RowTarget<'_>, system: Option<&str>, code: &str) -> CommonTokenValueKey {
    CommonTokenValueKey::new(
        target.shard_key,
        system.unwrap_or(DEFAULT_TOKEN_SYSTEM),
        code,
    )
}

fn reference_key(resource_type: &str, logical_id: &str) -> LogicalResourceIdentKey {
    LogicalResourceIdentKey::new(resource_type, logical_id)
}

/// First pass: notes every dictionary value the message needs.
fn note_identities(
    resolver: &mut IdentityResolver<'_>,
    message: &IndexMessage,
    target: &RowTarget<'_>,
) -> IndexResult<()> {
    for p in &message.string_values {
        resolver.note_parameter_name(&p.name);
    }
    for p in &message.number_values {
        resolver.note_parameter_name(&p.name);
    }
    for p in &message.date_values {
        resolver.note_parameter_name(&p.name);
    }
    for p in &message.quantity_values {
        resolver.note_parameter_name(&p.name);
        if let Some(system) = &p.value_system {
            resolver.note_code_system(system);
        }
    }
    for p in &message.location_values {
        resolver.note_parameter_name(&p.name);
    }
    for p in &message.token_values {
        resolver.note_parameter_name(&p.name);
        resolver.note_token_value(token_key(target, p.value_system.as_deref(), &p.value_code));
    }
    for p in message.tag_values.iter().chain(&message.security_values) {
        resolver.note_parameter_name(&p.name);
        resolver.note_token_value(token_key(target, p.value_system.as_deref(), &p.value_code));
    }
    for p in &message.profile_values {
        resolver.note_parameter_name(&p.name);
        resolver.note_canonical(&p.url);
    }
    for p in &message.ref_values {
        if resolver.resource_type_id(&p.ref_resource_type)?.is_some() {
            resolver.note_parameter_name(&p.name);
            resolver.note_logical_resource(reference_key(&p.ref_resource_type, &p.ref_logical_id));
        } else {
            warn!(
                parameter = %p.name,
                target = %p.ref_resource_type,
                "Skipping reference to unknown resource type"
            );
        }
    }
    Ok(())
}

/// Second pass: turns the message into writer rows using resolved ids.
fn write_parameters<W: ParameterBatchWriter + ?Sized>(
    writer: &mut W,
    resolver: &IdentityResolver<'_>,
    message: &IndexMessage,
    target: &RowTarget<'_>,
) -> IndexResult<()> {
    let name_id = |name: &str| resolver.id(&DictionaryKey::ParameterName(name.to_string()));
    let token_id = |system: Option<&str>, code: &str| {
        resolver.id(&DictionaryKey::CommonTokenValue(token_key(target, system, code)))
    };

    for p in &message.string_values {
        writer.add_string(target, name_id(&p.name)?, p)?;
    }
    for p in &message.number_values {
        writer.add_number(target, name_id(&p.name)?, p)?;
    }
    for p in &message.date_values {
        writer.add_date(target, name_id(&p.name)?, p)?;
    }
    for p in &message.quantity_values {
        let code_system_id = match &p.value_system {
            Some(system) => Some(resolver.id(&DictionaryKey::CodeSystem(system.clone()))?),
            None => None,
        };
        writer.add_quantity(target, name_id(&p.name)?, code_system_id, p)?;
    }
    for p in &message.location_values {
        writer.add_location(target, name_id(&p.name)?, p)?;
    }
    for p in &message.token_values {
        let id = token_id(p.value_system.as_deref(), &p.value_code)?;
        writer.add_token(target, name_id(&p.name)?, id, p)?;
    }
    for p in &message.tag_values {
        let id = token_id(p.value_system.as_deref(), &p.value_code)?;
        writer.add_tag(target, name_id(&p.name)?, id, p)?;
    }
    for p in &message.security_values {
        let id = token_id(p.value_system.as_deref(), &p.value_code)?;
        writer.add_security(target, name_id(&p.name)?, id, p)?;
    }
    for p in &message.profile_values {
        let id = resolver.id(&DictionaryKey::CanonicalValue(p.url.clone()))?;
        writer.add_profile(target, name_id(&p.name)?, id, p)?;
    }
    for p in &message.ref_values {
        let key = DictionaryKey::LogicalResourceIdent(reference_key(&p.ref_resource_type, &p.ref_logical_id));
        // Unknown target types were skipped when noting.
        if let Some(ref_id) = resolver.lookup(&key) {
            writer.add_reference(target, name_id(&p.name)?, ref_id, p)?;
        }
    }
    Ok(())
}
