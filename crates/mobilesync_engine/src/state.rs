//! Persisted sync definitions and the sync runner.
//!
//! A sync definition records what to sync (direction, soup, target
//! configuration, options) and how the last run went. Definitions live as
//! JSON records in a dedicated soup, so a sync created in one process can
//! be re-run in the next.
//!
//! The runner executes one sync at a time, sequentially: one page or batch
//! per network round trip. [`SyncRunner::stop`] is honored between pages
//! and batches, never in the middle of a request.

use crate::config::{MergeMode, SyncConfig, SyncOptions};
use crate::down::{DownTarget, FetchPage, SyncDownTarget};
use crate::error::{SyncError, SyncResult};
use crate::registry::TargetRegistry;
use crate::target::SyncContext;
use crate::transport::RestClient;
use crate::up::SyncUpTarget;
use mobilesync_protocol::Record;
use mobilesync_store::{
    entry_id, EntryId, Filter, IndexSpec, LocalStore, QuerySpec, SortOrder, StoreReader,
    SOUP_ENTRY_ID,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which way records travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncDirection {
    /// Server to local store.
    Down,
    /// Local store to server.
    Up,
}

/// Status of a sync definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Created, never run.
    New,
    /// Currently running.
    Running,
    /// Last run completed.
    Done,
    /// Last run failed.
    Failed,
    /// Last run was stopped.
    Stopped,
}

impl SyncStatus {
    /// Returns true if a new run may start from this status.
    pub fn can_start(&self) -> bool {
        !matches!(self, SyncStatus::Running)
    }
}

/// A sync as persisted in the syncs soup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDefinition {
    #[serde(rename = "_soupEntryId", default, skip_serializing_if = "Option::is_none")]
    id: Option<EntryId>,
    /// Unique name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Direction.
    pub direction: SyncDirection,
    /// Soup records are read from or written to.
    pub soup_name: String,
    /// Target configuration, discriminator included.
    pub target: Value,
    /// Options.
    #[serde(default)]
    pub options: SyncOptions,
    /// Status.
    pub status: SyncStatus,
    /// Progress of the current or last run, in percent.
    #[serde(default)]
    pub progress: u8,
    /// Records to sync in the current or last run, -1 when unknown.
    #[serde(default = "unknown_size")]
    pub total_size: i64,
    /// Latest modification time seen by a sync-down, -1 before the first.
    #[serde(default = "unknown_size")]
    pub max_time_stamp: i64,
    /// Error of the last failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn unknown_size() -> i64 {
    -1
}

impl SyncDefinition {
    fn new(
        name: Option<&str>,
        direction: SyncDirection,
        soup_name: &str,
        target: Value,
        options: SyncOptions,
    ) -> Self {
        Self {
            id: None,
            name: name.map(str::to_string),
            direction,
            soup_name: soup_name.to_string(),
            target,
            options,
            status: SyncStatus::New,
            progress: 0,
            total_size: -1,
            max_time_stamp: -1,
            error: None,
        }
    }

    /// Entry id in the syncs soup; `None` until saved.
    pub fn id(&self) -> Option<EntryId> {
        self.id
    }

    fn from_record(record: Record) -> SyncResult<Self> {
        Ok(serde_json::from_value(record.into_value())?)
    }

    fn to_record(&self) -> SyncResult<Record> {
        Record::from_value(serde_json::to_value(self)?)
            .ok_or_else(|| SyncError::config("sync definition does not serialize to an object"))
    }

    fn set_progress(&mut self, done: usize) {
        if self.total_size > 0 {
            let percent = (done as i64 * 100 / self.total_size).clamp(0, 100);
            self.progress = percent as u8;
        }
    }
}

/// Counters across runs.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Runs that completed.
    pub syncs_completed: u64,
    /// Runs that failed.
    pub syncs_failed: u64,
    /// Runs that were stopped.
    pub syncs_stopped: u64,
    /// Records fetched by sync-downs.
    pub records_down: u64,
    /// Records handed to sync-up targets.
    pub records_up: u64,
    /// Local records removed by ghost cleanup.
    pub ghosts_removed: u64,
    /// Error of the last failed run.
    pub last_error: Option<String>,
}

/// Creates, stores and runs syncs against one store and one server.
pub struct SyncRunner {
    config: SyncConfig,
    store: Arc<dyn LocalStore>,
    client: Arc<dyn RestClient>,
    registry: TargetRegistry,
    stats: RwLock<SyncStats>,
    stopped: AtomicBool,
}

impl fmt::Debug for SyncRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncRunner")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl SyncRunner {
    /// Creates a runner and registers the syncs soup.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        client: Arc<dyn RestClient>,
    ) -> SyncResult<Self> {
        store.register_soup(&config.syncs_soup, &[IndexSpec::string("name")])?;
        Ok(Self {
            config,
            store,
            client,
            registry: TargetRegistry::new(),
            stats: RwLock::new(SyncStats::default()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Replaces the target registry, e.g. with one holding custom targets.
    pub fn with_registry(mut self, registry: TargetRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// The target registry.
    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    /// Counters across runs.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Requests running syncs to stop at the next page or batch boundary.
    /// Later runs stop immediately until [`SyncRunner::restart`].
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Accepts syncs again after [`SyncRunner::stop`].
    pub fn restart(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Returns true if a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn check_stopped(&self) -> SyncResult<()> {
        if self.is_stopped() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn context(&self) -> SyncContext<'_> {
        SyncContext::new(self.store.as_ref(), self.client.as_ref(), &self.config.api_version)
    }

    fn save(&self, definition: &mut SyncDefinition) -> SyncResult<()> {
        let saved = self
            .store
            .upsert_one(&self.config.syncs_soup, definition.to_record()?, None)?;
        definition.id = entry_id(&saved);
        Ok(())
    }

    fn create(&self, definition: SyncDefinition) -> SyncResult<SyncDefinition> {
        if let Some(name) = &definition.name {
            if self.find_by_name(name)?.is_some() {
                return Err(SyncError::config(format!("a sync named {name} already exists")));
            }
        }
        let mut definition = definition;
        self.save(&mut definition)?;
        debug!(id = ?definition.id, soup = definition.soup_name.as_str(), "created sync");
        Ok(definition)
    }

    /// Stores a new sync-down definition.
    pub fn create_sync_down(
        &self,
        target: &SyncDownTarget,
        options: SyncOptions,
        soup: &str,
        name: Option<&str>,
    ) -> SyncResult<SyncDefinition> {
        let config = target.as_target().to_config()?;
        self.create(SyncDefinition::new(name, SyncDirection::Down, soup, config, options))
    }

    /// Stores a new sync-up definition.
    pub fn create_sync_up(
        &self,
        target: &SyncUpTarget,
        options: SyncOptions,
        soup: &str,
        name: Option<&str>,
    ) -> SyncResult<SyncDefinition> {
        let config = target.as_target().to_config()?;
        self.create(SyncDefinition::new(name, SyncDirection::Up, soup, config, options))
    }

    /// Creates a sync-down definition and runs it.
    pub fn sync_down(
        &self,
        target: &SyncDownTarget,
        options: SyncOptions,
        soup: &str,
        name: Option<&str>,
    ) -> SyncResult<SyncDefinition> {
        let definition = self.create_sync_down(target, options, soup, name)?;
        self.run_definition(definition)
    }

    /// Creates a sync-up definition and runs it.
    pub fn sync_up(
        &self,
        target: &SyncUpTarget,
        options: SyncOptions,
        soup: &str,
        name: Option<&str>,
    ) -> SyncResult<SyncDefinition> {
        let definition = self.create_sync_up(target, options, soup, name)?;
        self.run_definition(definition)
    }

    /// Loads a sync definition.
    pub fn sync_by_id(&self, id: EntryId) -> SyncResult<SyncDefinition> {
        let record = self
            .store
            .retrieve(&self.config.syncs_soup, &[id])?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::UnknownSync(id.to_string()))?;
        SyncDefinition::from_record(record)
    }

    fn find_by_name(&self, name: &str) -> SyncResult<Option<SyncDefinition>> {
        let spec = QuerySpec::matching(Filter::eq("name", name));
        match self.store.query_all(&self.config.syncs_soup, &spec)?.into_iter().next() {
            Some(record) => Ok(Some(SyncDefinition::from_record(record)?)),
            None => Ok(None),
        }
    }

    /// Loads a sync definition by name.
    pub fn sync_by_name(&self, name: &str) -> SyncResult<SyncDefinition> {
        self.find_by_name(name)?
            .ok_or_else(|| SyncError::UnknownSync(name.to_string()))
    }

    /// All stored sync definitions.
    pub fn syncs(&self) -> SyncResult<Vec<SyncDefinition>> {
        let spec = QuerySpec::all().order_by(SOUP_ENTRY_ID, SortOrder::Ascending);
        self.store
            .query_all(&self.config.syncs_soup, &spec)?
            .into_iter()
            .map(SyncDefinition::from_record)
            .collect()
    }

    /// Deletes a sync definition. Records it synced are kept.
    pub fn delete_sync(&self, id: EntryId) -> SyncResult<()> {
        self.sync_by_id(id)?;
        self.store.delete_entries(&self.config.syncs_soup, &[id])?;
        Ok(())
    }

    /// Runs a stored sync again. A sync-down resumes from the latest
    /// modification time it has seen.
    pub fn re_sync(&self, id: EntryId) -> SyncResult<SyncDefinition> {
        let definition = self.sync_by_id(id)?;
        self.run_definition(definition)
    }

    /// Runs a stored sync again, by name.
    pub fn re_sync_by_name(&self, name: &str) -> SyncResult<SyncDefinition> {
        let definition = self.sync_by_name(name)?;
        self.run_definition(definition)
    }

    /// Removes local records of a sync-down that the server no longer has
    /// and returns how many were removed.
    pub fn clean_resync_ghosts(&self, id: EntryId) -> SyncResult<usize> {
        let definition = self.sync_by_id(id)?;
        if definition.direction != SyncDirection::Down {
            return Err(SyncError::config("ghost cleanup applies to sync-down only"));
        }
        self.check_stopped()?;
        let target = self.registry.down_from_config(&definition.target)?;
        let removed = target
            .as_target()
            .clean_ghosts(&self.context(), &definition.soup_name, definition.id)?;
        self.stats.write().ghosts_removed += removed as u64;
        info!(id, removed, "cleaned resync ghosts");
        Ok(removed)
    }

    fn run_definition(&self, mut definition: SyncDefinition) -> SyncResult<SyncDefinition> {
        if !definition.status.can_start() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", definition.status),
                to: format!("{:?}", SyncStatus::Running),
            });
        }
        definition.status = SyncStatus::Running;
        definition.progress = 0;
        definition.error = None;
        self.save(&mut definition)?;

        let outcome = match definition.direction {
            SyncDirection::Down => self.run_down(&mut definition),
            SyncDirection::Up => self.run_up(&mut definition),
        };

        match outcome {
            Ok(()) => {
                definition.status = SyncStatus::Done;
                definition.progress = 100;
                self.save(&mut definition)?;
                self.stats.write().syncs_completed += 1;
                info!(id = ?definition.id, soup = definition.soup_name.as_str(), "sync done");
                Ok(definition)
            }
            Err(SyncError::Cancelled) => {
                definition.status = SyncStatus::Stopped;
                self.save(&mut definition)?;
                self.stats.write().syncs_stopped += 1;
                info!(id = ?definition.id, "sync stopped");
                Err(SyncError::Cancelled)
            }
            Err(error) => {
                definition.status = SyncStatus::Failed;
                definition.error = Some(error.to_string());
                self.save(&mut definition)?;
                {
                    let mut stats = self.stats.write();
                    stats.syncs_failed += 1;
                    stats.last_error = Some(error.to_string());
                }
                warn!(id = ?definition.id, error = %error, "sync failed");
                Err(error)
            }
        }
    }

    fn run_down(&self, definition: &mut SyncDefinition) -> SyncResult<()> {
        let target = self.registry.down_from_config(&definition.target)?;
        let target = target.as_target();
        let ctx = self.context();
        let soup = definition.soup_name.clone();
        let skipped: BTreeSet<String> = match definition.options.merge_mode {
            MergeMode::LeaveIfChanged => target.dirty_record_ids(&ctx, &soup)?,
            MergeMode::Overwrite => BTreeSet::new(),
        };

        self.check_stopped()?;
        let mut page = target.start_fetch(&ctx, &soup, definition.max_time_stamp)?;
        definition.total_size = page.total_size;
        let mut max_time_stamp = definition.max_time_stamp;
        let mut fetched = 0usize;
        loop {
            let FetchPage { records, cursor, .. } = page;
            fetched += records.len();
            max_time_stamp = max_time_stamp.max(target.latest_modification_timestamp(&records));
            let records = without_ids(target, records, &skipped);
            let saved = target.save_records(&ctx, &soup, records, definition.id)?;
            debug!(soup = soup.as_str(), saved, fetched, "saved page");

            if target.is_sorted_by_modification_date() {
                definition.max_time_stamp = max_time_stamp;
            }
            definition.set_progress(fetched);
            self.save(definition)?;

            let Some(cursor) = cursor else { break };
            self.check_stopped()?;
            match target.continue_fetch(&ctx, &soup, &cursor)? {
                Some(next) => page = next,
                None => break,
            }
        }
        definition.max_time_stamp = max_time_stamp;
        self.stats.write().records_down += fetched as u64;
        Ok(())
    }

    fn run_up(&self, definition: &mut SyncDefinition) -> SyncResult<()> {
        let target = self.registry.up_from_config(&definition.target)?;
        let target = target.as_target();
        let ctx = self.context();
        let soup = definition.soup_name.clone();
        let ids = target.dirty_entry_ids(&ctx, &soup)?;
        definition.total_size = ids.len() as i64;
        self.save(definition)?;

        let mut done = 0usize;
        for batch in ids.chunks(target.max_batch_size().max(1)) {
            self.check_stopped()?;
            let mut records = self.store.retrieve(&soup, batch)?;
            if definition.options.merge_mode == MergeMode::LeaveIfChanged {
                let newer = target.are_newer_than_server(&ctx, &records)?;
                let mut flags = newer.into_iter();
                records.retain(|_| flags.next().unwrap_or(true));
            }
            let sent = records.len();
            if !records.is_empty() {
                target.sync_up_records(&ctx, &soup, &definition.options, records)?;
            }
            done += batch.len();
            self.stats.write().records_up += sent as u64;
            definition.set_progress(done);
            self.save(definition)?;
        }
        Ok(())
    }
}

/// Drops records whose id is in `skipped`.
fn without_ids(
    target: &dyn DownTarget,
    records: Vec<Record>,
    skipped: &BTreeSet<String>,
) -> Vec<Record> {
    if skipped.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|r| target.record_id(r).map_or(true, |id| !skipped.contains(id)))
        .collect()
}
