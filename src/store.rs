use crate::attachment::{Attachment, AttachmentStorage};
use crate::batch::{ImportBatch, ImportRequest, ImportSummary};
use crate::error::{IncomeEvidenceError, Result};
use crate::query::{self, FilterState, Statistics};
use crate::reconcile::{CandidateRecord, Reconciler};
use crate::record::{IncomeRecord, RecordEdit};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub created_time: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub schema_version: u32,
    pub total_records: usize,
}

impl StoreMetadata {
    fn fresh() -> Self {
        let now = Utc::now();
        Self {
            created_time: now,
            last_modified: now,
            schema_version: SCHEMA_VERSION,
            total_records: 0,
        }
    }
}

/// On-disk layout of the whole store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    metadata: StoreMetadata,
    #[serde(default)]
    records: BTreeMap<String, IncomeRecord>,
    #[serde(default)]
    attachments: BTreeMap<String, Attachment>,
    #[serde(default)]
    versions: Vec<ImportBatch>,
    #[serde(default)]
    filter_state: Option<FilterState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted { attachments_removed: usize },
    AlreadyAbsent,
}

/// Keyed collection of income records plus everything persisted alongside
/// them. Every mutating call writes the snapshot back when the store is
/// file-backed.
pub struct RecordStore {
    path: Option<PathBuf>,
    metadata: StoreMetadata,
    records: BTreeMap<String, IncomeRecord>,
    attachments: BTreeMap<String, Attachment>,
    versions: Vec<ImportBatch>,
    filter_state: Option<FilterState>,
    storage: Option<Box<dyn AttachmentStorage>>,
}

impl RecordStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            metadata: StoreMetadata::fresh(),
            records: BTreeMap::new(),
            attachments: BTreeMap::new(),
            versions: Vec::new(),
            filter_state: None,
            storage: None,
        }
    }

    /// Opens the snapshot at `path`. A missing file yields an empty store; an
    /// unreadable one is an error and the file is left as it is.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Self::in_memory();
        store.path = Some(path.into());
        store.load()?;
        Ok(store)
    }

    /// Routes file deletion for cascaded attachment removal.
    pub fn with_attachment_storage(mut self, storage: Box<dyn AttachmentStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn set_attachment_storage(&mut self, storage: Box<dyn AttachmentStorage>) {
        self.storage = Some(storage);
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    pub fn get(&self, contract_id: &str) -> Option<&IncomeRecord> {
        self.records.get(contract_id)
    }

    /// Snapshot of every record, ordered by contract id.
    pub fn list_all(&self) -> Vec<IncomeRecord> {
        self.records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, contract_id: &str) -> bool {
        self.records.contains_key(contract_id)
    }

    pub fn add(&mut self, record: IncomeRecord) -> Result<()> {
        if self.records.contains_key(&record.contract_id) {
            return Err(IncomeEvidenceError::DuplicateKey(record.contract_id));
        }
        record.validate()?;

        debug!("Adding contract {}", record.contract_id);
        let before = self.checkpoint();
        self.records.insert(record.contract_id.clone(), record);
        self.commit(before)
    }

    /// Replaces the stored record wholesale.
    pub fn update(&mut self, contract_id: &str, record: IncomeRecord) -> Result<()> {
        if !self.records.contains_key(contract_id) {
            return Err(IncomeEvidenceError::NotFound(contract_id.to_string()));
        }
        if record.contract_id != contract_id {
            return Err(IncomeEvidenceError::validation(
                "contract_id",
                format!(
                    "record id '{}' does not match the key '{}'",
                    record.contract_id, contract_id
                ),
            ));
        }
        record.validate()?;

        let before = self.checkpoint();
        self.records.insert(contract_id.to_string(), record);
        self.commit(before)
    }

    /// Applies a partial user edit and returns the updated record.
    pub fn edit(&mut self, contract_id: &str, edit: &RecordEdit) -> Result<IncomeRecord> {
        let before = self.checkpoint();
        let record = self
            .records
            .get_mut(contract_id)
            .ok_or_else(|| IncomeEvidenceError::NotFound(contract_id.to_string()))?;
        record.apply_edit(edit)?;
        let updated = record.clone();

        self.commit(before)?;
        Ok(updated)
    }

    /// Removes the record and its catalogue attachments, then deletes the
    /// catalogued files. Paths linked on the record without a catalogue entry
    /// are only unlinked. Deleting an id that is not stored succeeds with
    /// [`DeleteOutcome::AlreadyAbsent`].
    pub fn delete(&mut self, contract_id: &str) -> Result<DeleteOutcome> {
        if !self.records.contains_key(contract_id) {
            warn!("Delete requested for unknown contract {}", contract_id);
            return Ok(DeleteOutcome::AlreadyAbsent);
        }

        let before = self.checkpoint();
        self.records.remove(contract_id);

        let attachment_ids: Vec<String> = self
            .attachments
            .values()
            .filter(|a| a.contract_id == contract_id)
            .map(|a| a.id.clone())
            .collect();

        let stored_paths: BTreeSet<String> = attachment_ids
            .iter()
            .filter_map(|id| self.attachments.remove(id))
            .map(|attachment| attachment.stored_path)
            .collect();

        self.commit(before)?;

        for path in &stored_paths {
            self.delete_stored_file(path);
        }

        info!(
            "Deleted contract {} ({} attachments, {} files)",
            contract_id,
            attachment_ids.len(),
            stored_paths.len()
        );

        Ok(DeleteOutcome::Deleted {
            attachments_removed: attachment_ids.len(),
        })
    }

    /// Reconciles a batch against the current records and stores the result
    /// as the next version.
    pub fn import_batch(
        &mut self,
        candidates: Vec<CandidateRecord>,
        request: ImportRequest,
    ) -> Result<ImportSummary> {
        let outcome = Reconciler::new(&self.records, self.latest_version())
            .reconcile(candidates, &request)?;

        let persisted_count = outcome.records.len();
        let summary = ImportSummary {
            version: outcome.batch.version,
            persisted_count,
            new_contract_ids: outcome.batch.new_contract_ids.clone(),
            changed_contract_ids: outcome.batch.changed_contract_ids.clone(),
            import_errors: outcome.errors,
        };

        let before = self.checkpoint();
        self.records.extend(outcome.records);
        self.versions.push(outcome.batch);
        self.commit(before)?;

        info!(
            "Imported version {} from '{}': {} records, {} new, {} changed, {} rejected",
            summary.version,
            request.source_descriptor,
            persisted_count,
            summary.new_contract_ids.len(),
            summary.changed_contract_ids.len(),
            summary.import_errors.len()
        );

        Ok(summary)
    }

    pub fn versions(&self) -> &[ImportBatch] {
        &self.versions
    }

    /// Highest imported version, 0 before the first import.
    pub fn latest_version(&self) -> u32 {
        self.versions.iter().map(|b| b.version).max().unwrap_or(0)
    }

    pub fn statistics(&self) -> Result<Statistics> {
        query::statistics(&self.list_all())
    }

    /// Adds a catalogue entry and links its stored path to the record.
    pub fn add_attachment(&mut self, attachment: Attachment) -> Result<()> {
        if !self.records.contains_key(&attachment.contract_id) {
            return Err(IncomeEvidenceError::NotFound(attachment.contract_id.clone()));
        }

        let before = self.checkpoint();
        if let Some(record) = self.records.get_mut(&attachment.contract_id) {
            record.add_attached_file(attachment.stored_path.clone());
        }

        debug!(
            "Linked attachment {} to contract {}",
            attachment.id, attachment.contract_id
        );
        self.attachments.insert(attachment.id.clone(), attachment);
        self.commit(before)
    }

    /// Removes a catalogue entry, unlinks it and deletes its file. Returns
    /// `false` when the id is unknown.
    pub fn delete_attachment(&mut self, attachment_id: &str) -> Result<bool> {
        if !self.attachments.contains_key(attachment_id) {
            warn!("Attachment {} not found", attachment_id);
            return Ok(false);
        }

        let before = self.checkpoint();
        let Some(attachment) = self.attachments.remove(attachment_id) else {
            return Ok(false);
        };
        if let Some(record) = self.records.get_mut(&attachment.contract_id) {
            record.remove_attached_file(&attachment.stored_path);
        }
        self.commit(before)?;

        self.delete_stored_file(&attachment.stored_path);
        Ok(true)
    }

    pub fn attachment(&self, attachment_id: &str) -> Option<&Attachment> {
        self.attachments.get(attachment_id)
    }

    pub fn attachments_for_contract(&self, contract_id: &str) -> Vec<&Attachment> {
        let mut found: Vec<&Attachment> = self
            .attachments
            .values()
            .filter(|a| a.contract_id == contract_id)
            .collect();
        found.sort_by(|a, b| a.created_time.cmp(&b.created_time));
        found
    }

    pub fn save_filter_state(&mut self, state: FilterState) -> Result<()> {
        let before = self.checkpoint();
        self.filter_state = Some(state);
        self.commit(before)
    }

    pub fn filter_state(&self) -> Option<&FilterState> {
        self.filter_state.as_ref()
    }

    pub fn clear_filter_state(&mut self) -> Result<()> {
        let before = self.checkpoint();
        self.filter_state = None;
        self.commit(before)
    }

    /// Drops every record, attachment entry, version and saved filter.
    /// Attachment files on disk are left alone.
    pub fn clear_all(&mut self) -> Result<()> {
        info!("Clearing {} records", self.records.len());
        let before = self.checkpoint();
        self.metadata = StoreMetadata::fresh();
        self.records.clear();
        self.attachments.clear();
        self.versions.clear();
        self.filter_state = None;
        self.commit(before)
    }

    /// Writes the full snapshot to the backing file.
    pub fn save(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        let mut snapshot = self.snapshot();
        snapshot.metadata.last_modified = Utc::now();
        snapshot.metadata.total_records = self.records.len();
        write_snapshot(&snapshot, &path)?;
        self.metadata = snapshot.metadata;

        debug!("Saved {} records to {}", self.records.len(), path.display());
        Ok(())
    }

    /// Re-reads the backing file, replacing in-memory state. A missing file
    /// resets to an empty store.
    pub fn load(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        if !path.exists() {
            info!("No data file at {}, starting empty", path.display());
            self.replace_with(fresh_snapshot());
            return Ok(());
        }

        let snapshot = read_snapshot(&path)?;
        info!(
            "Loaded {} records and {} versions from {}",
            snapshot.records.len(),
            snapshot.versions.len(),
            path.display()
        );
        self.replace_with(snapshot);
        Ok(())
    }

    /// Writes a copy of the current snapshot into `dir` and returns its path.
    /// Without a name, a timestamped `backup_*.json` name is used.
    pub fn backup(&mut self, dir: &Path, name: Option<&str>) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(|e| {
            IncomeEvidenceError::PersistenceError(format!(
                "cannot create backup directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let file_name = match name {
            Some(name) if name.ends_with(".json") => name.to_string(),
            Some(name) => format!("{}.json", name),
            None => format!("backup_{}.json", Utc::now().format("%Y%m%d_%H%M%S_%3f")),
        };
        let target = dir.join(file_name);

        self.metadata.total_records = self.records.len();
        write_snapshot(&self.snapshot(), &target)?;

        info!("Backup written to {}", target.display());
        Ok(target)
    }

    /// Replaces the current state with a backup and persists it.
    pub fn restore(&mut self, backup_file: &Path) -> Result<()> {
        if !backup_file.exists() {
            return Err(IncomeEvidenceError::PersistenceError(format!(
                "backup file {} does not exist",
                backup_file.display()
            )));
        }

        let snapshot = read_snapshot(backup_file)?;
        info!(
            "Restoring {} records from {}",
            snapshot.records.len(),
            backup_file.display()
        );
        let before = self.checkpoint();
        self.replace_with(snapshot);
        self.commit(before)
    }

    /// Keeps the newest `keep` JSON backups in `dir` and returns how many
    /// were removed.
    pub fn prune_backups(dir: &Path, keep: usize) -> Result<usize> {
        if !dir.exists() {
            return Ok(0);
        }

        let mut backups = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let modified = fs::metadata(&path)?.modified()?;
            backups.push((modified, path));
        }

        backups.sort_by(|a, b| b.cmp(a));

        let mut removed = 0;
        for (_, path) in backups.into_iter().skip(keep) {
            fs::remove_file(&path)?;
            debug!("Pruned backup {}", path.display());
            removed += 1;
        }
        Ok(removed)
    }

    /// State to fall back to if the next save fails. In-memory stores never
    /// fail to save and skip the copy.
    fn checkpoint(&self) -> Option<Snapshot> {
        self.path.as_ref().map(|_| self.snapshot())
    }

    /// Saves the mutated state, or puts `before` back so memory keeps
    /// matching what is on disk.
    fn commit(&mut self, before: Option<Snapshot>) -> Result<()> {
        if self.path.is_none() {
            self.metadata.last_modified = Utc::now();
            self.metadata.total_records = self.records.len();
            return Ok(());
        }

        if let Err(e) = self.save() {
            if let Some(before) = before {
                warn!("Save failed, rolling back in-memory changes: {}", e);
                self.replace_with(before);
            }
            return Err(e);
        }
        Ok(())
    }

    fn delete_stored_file(&self, stored_path: &str) {
        let Some(storage) = &self.storage else {
            return;
        };
        match storage.delete(stored_path) {
            Ok(true) => debug!("Deleted attachment file {}", stored_path),
            Ok(false) => debug!("Attachment file {} not deleted", stored_path),
            Err(e) => error!("Failed to delete attachment file {}: {}", stored_path, e),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            metadata: self.metadata.clone(),
            records: self.records.clone(),
            attachments: self.attachments.clone(),
            versions: self.versions.clone(),
            filter_state: self.filter_state.clone(),
        }
    }

    fn replace_with(&mut self, snapshot: Snapshot) {
        self.metadata = snapshot.metadata;
        self.records = snapshot.records;
        self.attachments = snapshot.attachments;
        self.versions = snapshot.versions;
        self.filter_state = snapshot.filter_state;
    }
}

fn fresh_snapshot() -> Snapshot {
    Snapshot {
        metadata: StoreMetadata::fresh(),
        records: BTreeMap::new(),
        attachments: BTreeMap::new(),
        versions: Vec::new(),
        filter_state: None,
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let content = fs::read_to_string(path).map_err(|e| {
        IncomeEvidenceError::PersistenceError(format!("cannot read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        IncomeEvidenceError::PersistenceError(format!("corrupt data file {}: {}", path.display(), e))
    })
}

/// Writes through a sibling temp file so a failed write never truncates the
/// previous snapshot.
fn write_snapshot(snapshot: &Snapshot, path: &Path) -> Result<()> {
    let persistence = |e: std::io::Error| {
        IncomeEvidenceError::PersistenceError(format!("cannot write {}: {}", path.display(), e))
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(persistence)?;
    }

    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| IncomeEvidenceError::PersistenceError(e.to_string()))?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(persistence)?;
    fs::rename(&tmp, path).map_err(persistence)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::FsAttachmentStorage;
    use crate::query::FilterCriteria;
    use rust_decimal_macros::dec;

    fn record(id: &str, income: rust_decimal::Decimal) -> IncomeRecord {
        IncomeRecord::new(id, "Acme", income).unwrap()
    }

    #[test]
    fn test_add_get_and_duplicate_key() {
        let mut store = RecordStore::in_memory();
        store.add(record("C2", dec!(20))).unwrap();
        store.add(record("C1", dec!(10))).unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.contains("C1"));
        assert_eq!(store.get("C1").unwrap().annual_confirmed_income, dec!(10));
        let ids: Vec<String> = store.list_all().into_iter().map(|r| r.contract_id).collect();
        assert_eq!(ids, vec!["C1", "C2"]);

        let err = store.add(record("C1", dec!(99))).unwrap_err();
        assert!(matches!(err, IncomeEvidenceError::DuplicateKey(id) if id == "C1"));
    }

    #[test]
    fn test_update_requires_existing_matching_key() {
        let mut store = RecordStore::in_memory();
        assert!(matches!(
            store.update("C1", record("C1", dec!(1))),
            Err(IncomeEvidenceError::NotFound(_))
        ));

        store.add(record("C1", dec!(1))).unwrap();
        assert!(matches!(
            store.update("C1", record("C9", dec!(1))),
            Err(IncomeEvidenceError::ValidationError { .. })
        ));

        store.update("C1", record("C1", dec!(5))).unwrap();
        assert_eq!(store.get("C1").unwrap().annual_confirmed_income, dec!(5));
    }

    #[test]
    fn test_edit_is_all_or_nothing() {
        let mut store = RecordStore::in_memory();
        store.add(record("C1", dec!(100))).unwrap();

        let updated = store
            .edit(
                "C1",
                &RecordEdit {
                    attachment_confirmed_income: Some(Some(dec!(80))),
                    difference_note: Some("short-paid".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.difference(), Some(dec!(20)));

        let bad = RecordEdit {
            difference_note: Some("ignored".to_string()),
            annual_confirmed_income: Some(dec!(-1)),
            ..Default::default()
        };
        assert!(store.edit("C1", &bad).is_err());
        assert_eq!(store.get("C1").unwrap().difference_note, "short-paid");
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let mut store = RecordStore::in_memory();
        store.add(record("C1", dec!(1))).unwrap();

        assert_eq!(store.delete("NOPE").unwrap(), DeleteOutcome::AlreadyAbsent);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_delete_cascades_to_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsAttachmentStorage::new(dir.path().join("files")).unwrap();

        let source = dir.path().join("invoice.pdf");
        fs::write(&source, b"pdf").unwrap();
        let stored = storage.save(&source, "C1", None).unwrap();

        let mut store = RecordStore::in_memory().with_attachment_storage(Box::new(storage));
        store.add(record("C1", dec!(1))).unwrap();
        store
            .add_attachment(Attachment::new("C1", source.to_string_lossy(), stored.clone()))
            .unwrap();
        assert_eq!(store.get("C1").unwrap().attached_file_paths, vec![stored.clone()]);
        assert_eq!(store.attachments_for_contract("C1").len(), 1);

        let outcome = store.delete("C1").unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted { attachments_removed: 1 });
        assert!(store.attachments_for_contract("C1").is_empty());
        assert!(!Path::new(&stored).exists());
    }

    #[test]
    fn test_delete_leaves_uncatalogued_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsAttachmentStorage::new(dir.path().join("files")).unwrap();

        let original = dir.path().join("original_contract.pdf");
        fs::write(&original, b"the only copy").unwrap();
        let scan = dir.path().join("scan.png");
        fs::write(&scan, b"png").unwrap();
        let stored = storage.save(&scan, "C1", None).unwrap();

        let mut linked = record("C1", dec!(1));
        linked.add_attached_file(original.to_string_lossy());
        let mut store = RecordStore::in_memory().with_attachment_storage(Box::new(storage));
        store.add(linked).unwrap();
        store
            .add_attachment(Attachment::new("C1", scan.to_string_lossy(), stored.clone()))
            .unwrap();

        let outcome = store.delete("C1").unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted { attachments_removed: 1 });
        assert!(original.exists());
        assert!(!Path::new(&stored).exists());
    }

    #[test]
    fn test_failed_save_rolls_back_import() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("income.json");
        let mut store = RecordStore::open(&path).unwrap();

        let blocker = dir.path().join("income.json.tmp");
        fs::create_dir(&blocker).unwrap();

        let result = store.import_batch(
            vec![CandidateRecord::new("C1", "Acme", dec!(1000))],
            ImportRequest::new("jan.csv"),
        );
        assert!(matches!(result, Err(IncomeEvidenceError::PersistenceError(_))));
        assert!(store.is_empty());
        assert!(store.versions().is_empty());
        assert!(matches!(
            store.add(record("C2", dec!(1))),
            Err(IncomeEvidenceError::PersistenceError(_))
        ));
        assert!(!store.contains("C2"));

        fs::remove_dir(&blocker).unwrap();
        let retry = store
            .import_batch(
                vec![CandidateRecord::new("C1", "Acme", dec!(1000))],
                ImportRequest::new("jan.csv"),
            )
            .unwrap();
        assert_eq!(retry.version, 1);
        assert!(retry.new_contract_ids.contains("C1"));
        assert!(store.get("C1").unwrap().is_new);
    }

    #[test]
    fn test_delete_attachment_unlinks_record() {
        let mut store = RecordStore::in_memory();
        store.add(record("C1", dec!(1))).unwrap();
        let attachment = Attachment::new("C1", "/tmp/a.png", "C1/a.png");
        let id = attachment.id.clone();
        store.add_attachment(attachment).unwrap();

        assert!(store.delete_attachment(&id).unwrap());
        assert!(store.get("C1").unwrap().attached_file_paths.is_empty());
        assert!(!store.delete_attachment(&id).unwrap());

        let orphan = Attachment::new("C404", "/tmp/b.png", "C404/b.png");
        assert!(matches!(
            store.add_attachment(orphan),
            Err(IncomeEvidenceError::NotFound(_))
        ));
    }

    #[test]
    fn test_import_batch_bumps_versions() {
        let mut store = RecordStore::in_memory();
        let first = store
            .import_batch(
                vec![CandidateRecord::new("C1", "Acme", dec!(1000))],
                ImportRequest::new("jan.csv"),
            )
            .unwrap();
        assert_eq!(first.version, 1);
        assert!(store.get("C1").unwrap().is_new);

        let second = store
            .import_batch(
                vec![
                    CandidateRecord::new("C1", "Acme", dec!(1200)),
                    CandidateRecord::new("C2", "Globex", dec!(10)),
                ],
                ImportRequest::new("feb.csv"),
            )
            .unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.persisted_count, 2);
        assert!(second.changed_contract_ids.contains("C1"));
        assert!(second.new_contract_ids.contains("C2"));
        assert_eq!(store.get("C1").unwrap().change_amount, Some(dec!(200)));
        assert_eq!(store.latest_version(), 2);
        assert_eq!(store.versions().len(), 2);
    }

    #[test]
    fn test_failed_import_leaves_store_untouched() {
        let mut store = RecordStore::in_memory();
        store.add(record("C1", dec!(1))).unwrap();

        let result = store.import_batch(
            vec![CandidateRecord::new("", "Nobody", dec!(1))],
            ImportRequest::new("bad.csv"),
        );
        assert!(matches!(result, Err(IncomeEvidenceError::ImportError { .. })));
        assert_eq!(store.len(), 1);
        assert!(store.versions().is_empty());
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("income.json");

        {
            let mut store = RecordStore::open(&path).unwrap();
            assert!(store.is_empty());
            store
                .import_batch(
                    vec![CandidateRecord::new("C1", "Acme", dec!(1000.50))],
                    ImportRequest::new("jan.csv"),
                )
                .unwrap();
            store
                .save_filter_state(FilterState {
                    keyword: "acme".to_string(),
                    criteria: FilterCriteria {
                        min_income: Some(dec!(10)),
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .unwrap();
        }

        let reopened = RecordStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get("C1").unwrap().annual_confirmed_income, dec!(1000.50));
        assert_eq!(reopened.latest_version(), 1);
        assert_eq!(reopened.metadata().total_records, 1);
        assert_eq!(reopened.metadata().schema_version, SCHEMA_VERSION);
        assert_eq!(reopened.filter_state().unwrap().keyword, "acme");
    }

    #[test]
    fn test_corrupt_file_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("income.json");
        fs::write(&path, "{ not json").unwrap();

        let result = RecordStore::open(&path);
        assert!(matches!(result, Err(IncomeEvidenceError::PersistenceError(_))));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn test_backup_restore_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backups");
        let mut store = RecordStore::open(dir.path().join("income.json")).unwrap();
        store.add(record("C1", dec!(1))).unwrap();

        let backup = store.backup(&backups, Some("before_clear")).unwrap();
        assert!(backup.ends_with("before_clear.json"));

        store.clear_all().unwrap();
        assert!(store.is_empty());

        store.restore(&backup).unwrap();
        assert!(store.contains("C1"));

        store.backup(&backups, Some("second")).unwrap();
        store.backup(&backups, None).unwrap();
        let removed = RecordStore::prune_backups(&backups, 1).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(fs::read_dir(&backups).unwrap().count(), 1);
    }
}
