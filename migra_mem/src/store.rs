use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use migra_core::prelude::*;

use crate::catalog::Catalog;

#[derive(Debug, Clone)]
struct Row {
    entry: StatusEntry,
    forward_query: String,
    reverse_query: String,
    transactional: bool,
}

impl Row {
    /// Whether this is a registration of `migration` that no run has started executing.
    fn is_adoptable(&self, migration: &Migration) -> bool {
        self.entry.status == MigrationStatus::Registered
            && self.entry.name == migration.name()
            && self.forward_query == migration.forward_query()
            && self.reverse_query == migration.reverse_query()
            && self.transactional == migration.is_transactional()
    }
}

/// The in-memory data store.
#[derive(Debug)]
struct StoreData {
    reachable: bool,
    schema_ready: bool,
    schema_creations: usize,
    failing_polls: usize,
    next_id: i64,
    rows: Vec<Row>,
    catalog: Catalog,
    executed: Vec<String>,
    transitions: Vec<(SequenceId, MigrationStatus)>,
    fail_on: HashSet<String>,
}

impl StoreData {
    fn check_ready(&self) -> Result<(), StoreError> {
        if !self.reachable {
            return Err(StoreError::Unreachable(
                "in-memory store marked unreachable".to_string(),
            ));
        }
        if !self.schema_ready {
            return Err(StoreError::Schema(
                "migration ledger does not exist".to_string(),
            ));
        }
        Ok(())
    }

    fn row_mut(&mut self, sequence_id: SequenceId) -> Option<&mut Row> {
        self.rows
            .iter_mut()
            .find(|row| row.entry.sequence_id == sequence_id)
    }

    /// Moves `sequence_id` from `from` to `to`, failing when the entry is in any other state.
    fn transition(
        &mut self,
        sequence_id: SequenceId,
        from: MigrationStatus,
        to: MigrationStatus,
    ) -> Result<(), StoreError> {
        let row = self
            .row_mut(sequence_id)
            .ok_or_else(|| StoreError::StatusTransition {
                sequence_id,
                status: to,
                reason: "no such entry".to_string(),
            })?;
        if row.entry.status != from || !from.can_transition_to(to) {
            return Err(StoreError::StatusTransition {
                sequence_id,
                status: to,
                reason: format!("entry is {}", row.entry.status),
            });
        }
        row.entry.status = to;
        log::debug!("Entry {} moved from {} to {}", sequence_id, from, to);
        self.transitions.push((sequence_id, to));
        Ok(())
    }

    fn run(&mut self, script: &str, transactional: bool) -> Result<(), String> {
        if self.fail_on.contains(script) {
            return Err("injected failure".to_string());
        }
        self.catalog
            .run_script(script, transactional)
            .map_err(|err| err.to_string())?;
        self.executed.push(script.to_string());
        Ok(())
    }

    fn rollback(&mut self, name: Option<&str>) -> Result<StatusEntry, StoreError> {
        self.check_ready()?;
        let target = self
            .rows
            .iter()
            .rev()
            .find(|row| row.entry.status.is_applied() && name.is_none_or(|name| row.entry.name == name))
            .cloned();
        let Some(row) = target else {
            return Err(match name {
                Some(name) => StoreError::NotFound(name.to_string()),
                None => StoreError::NothingApplied,
            });
        };
        let sequence_id = row.entry.sequence_id;
        let name = row.entry.name.clone();

        if row.reverse_query.trim().is_empty() {
            return Err(StoreError::MissingReverse(name));
        }
        if row.entry.status == MigrationStatus::Ready {
            self.transition(sequence_id, MigrationStatus::Ready, MigrationStatus::RollingBack)?;
        }
        if let Err(reason) = self.run(&row.reverse_query, row.transactional) {
            log::debug!("Reverse script of {} failed: {}", name, reason);
            return Err(StoreError::Rollback { name, reason });
        }
        self.transition(
            sequence_id,
            MigrationStatus::RollingBack,
            MigrationStatus::RolledBack,
        )?;

        let mut entry = row.entry;
        entry.status = MigrationStatus::RolledBack;
        Ok(entry)
    }
}

/// An in-memory migration store.
///
/// Useful for tests and for trying out a batch without a database. Nothing is persisted. Clones
/// share the same ledger and catalog, so a test can keep a handle for inspection while the
/// coordinator owns another.
#[derive(Clone, Debug)]
pub struct InMemoryMigrationStore {
    data: Arc<Mutex<StoreData>>,
}

impl Default for InMemoryMigrationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMigrationStore {
    /// Creates an empty, reachable store without a ledger.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryMigrationStore");
        Self {
            data: Arc::new(Mutex::new(StoreData {
                reachable: true,
                schema_ready: false,
                schema_creations: 0,
                failing_polls: 0,
                next_id: 0,
                rows: Vec::new(),
                catalog: Catalog::new(),
                executed: Vec::new(),
                transitions: Vec::new(),
                fail_on: HashSet::new(),
            })),
        }
    }

    /// Makes every operation fail with [`StoreError::Unreachable`] until set back.
    pub async fn set_reachable(&self, reachable: bool) {
        self.data.lock().await.reachable = reachable;
    }

    /// Makes the next `count` calls to `next_turn` fail with [`StoreError::Unreachable`].
    pub async fn fail_next_polls(&self, count: usize) {
        self.data.lock().await.failing_polls = count;
    }

    /// Makes any script equal to `script` fail, forward or reverse.
    pub async fn fail_on(&self, script: impl Into<String>) {
        self.data.lock().await.fail_on.insert(script.into());
    }

    /// Tables currently in the catalog.
    pub async fn tables(&self) -> Vec<String> {
        self.data.lock().await.catalog.tables()
    }

    /// Columns of `table`, if it exists.
    pub async fn columns(&self, table: &str) -> Option<Vec<String>> {
        self.data
            .lock()
            .await
            .catalog
            .columns(table)
            .map(<[String]>::to_vec)
    }

    /// Scripts that completed successfully, in execution order.
    pub async fn executed_scripts(&self) -> Vec<String> {
        self.data.lock().await.executed.clone()
    }

    /// Every status write after registration, in the order it happened.
    pub async fn transitions(&self) -> Vec<(SequenceId, MigrationStatus)> {
        self.data.lock().await.transitions.clone()
    }

    /// How many times `ensure_schema` created the ledger.
    pub async fn schema_creations(&self) -> usize {
        self.data.lock().await.schema_creations
    }

    /// The ledger entry with the given sequence id.
    pub async fn entry(&self, sequence_id: SequenceId) -> Option<StatusEntry> {
        self.data
            .lock()
            .await
            .rows
            .iter()
            .find(|row| row.entry.sequence_id == sequence_id)
            .map(|row| row.entry.clone())
    }
}

#[async_trait]
impl MigrationStore for InMemoryMigrationStore {
    async fn ping(&self) -> Result<(), StoreError> {
        if self.data.lock().await.reachable {
            Ok(())
        } else {
            Err(StoreError::Unreachable(
                "in-memory store marked unreachable".to_string(),
            ))
        }
    }

    async fn ensure_schema(&self) -> Result<SchemaState, StoreError> {
        let mut data = self.data.lock().await;
        if !data.reachable {
            return Err(StoreError::Unreachable(
                "in-memory store marked unreachable".to_string(),
            ));
        }
        if data.schema_ready {
            return Ok(SchemaState::Existing);
        }
        data.schema_ready = true;
        data.schema_creations += 1;
        log::debug!("Created in-memory migration ledger");
        Ok(SchemaState::Created)
    }

    async fn register(&self, migration: &Migration) -> Result<SequenceId, StoreError> {
        let mut data = self.data.lock().await;
        data.check_ready()?;
        if let Some(row) = data.rows.iter().find(|row| row.is_adoptable(migration)) {
            log::debug!(
                "Adopted entry {} left registered for {}",
                row.entry.sequence_id,
                migration.name()
            );
            return Ok(row.entry.sequence_id);
        }
        if data
            .rows
            .iter()
            .any(|row| row.entry.name == migration.name() && row.entry.status.is_live())
        {
            return Err(StoreError::AlreadyExists(migration.name().to_string()));
        }

        data.next_id += 1;
        let sequence_id = SequenceId(data.next_id);
        data.rows.push(Row {
            entry: StatusEntry {
                sequence_id,
                name: migration.name().to_string(),
                status: MigrationStatus::Registered,
                registered_at: Utc::now(),
            },
            forward_query: migration.forward_query().to_string(),
            reverse_query: migration.reverse_query().to_string(),
            transactional: migration.is_transactional(),
        });
        log::debug!("Registered {} as entry {}", migration.name(), sequence_id);
        Ok(sequence_id)
    }

    async fn execute(&self, migration: &Migration, sequence_id: SequenceId) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        data.check_ready()?;
        data.transition(sequence_id, MigrationStatus::Registered, MigrationStatus::Pending)?;

        match data.run(migration.forward_query(), migration.is_transactional()) {
            Ok(()) => data.transition(sequence_id, MigrationStatus::Pending, MigrationStatus::Ready),
            Err(reason) => {
                data.transition(sequence_id, MigrationStatus::Pending, MigrationStatus::Fail)?;
                Err(StoreError::Execution {
                    name: migration.name().to_string(),
                    reason,
                })
            }
        }
    }

    async fn rollback_last(&self) -> Result<StatusEntry, StoreError> {
        self.data.lock().await.rollback(None)
    }

    async fn rollback_by_name(&self, name: &str) -> Result<StatusEntry, StoreError> {
        self.data.lock().await.rollback(Some(name))
    }

    async fn list_status(&self) -> Result<Vec<StatusEntry>, StoreError> {
        let data = self.data.lock().await;
        data.check_ready()?;
        Ok(data.rows.iter().map(|row| row.entry.clone()).collect())
    }

    async fn next_turn(&self) -> Result<Option<SequenceId>, StoreError> {
        let mut data = self.data.lock().await;
        if data.failing_polls > 0 {
            data.failing_polls -= 1;
            return Err(StoreError::Unreachable("injected poll failure".to_string()));
        }
        data.check_ready()?;
        Ok(data
            .rows
            .iter()
            .filter(|row| row.entry.status.is_in_flight())
            .map(|row| row.entry.sequence_id)
            .min())
    }

    async fn first_live_sequence(&self, name: &str) -> Result<Option<SequenceId>, StoreError> {
        let data = self.data.lock().await;
        data.check_ready()?;
        Ok(data
            .rows
            .iter()
            .filter(|row| row.entry.name == name && row.entry.status.is_live())
            .map(|row| row.entry.sequence_id)
            .min())
    }
}
