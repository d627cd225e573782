//! # Income Evidence Tracker
//!
//! A library for reconciling per-contract income figures imported from
//! spreadsheets against the income actually confirmed by supporting documents.
//!
//! ## Core Concepts
//!
//! - **Business fields**: contract id, client, subject entity and this year's
//!   confirmed income. Re-imports overwrite them.
//! - **Annotations**: attachment-confirmed income, difference note and attached
//!   files. They belong to the user and survive every re-import.
//! - **Versions**: each import becomes one numbered batch recording which
//!   contracts were new and which changed income, and by how much.
//! - **Queries**: filtering, keyword search, sorting, grouping and statistics
//!   over any list of records, without touching the store.
//!
//! ## Example
//!
//! ```rust,ignore
//! use income_evidence_tracker::*;
//! use std::path::Path;
//!
//! let mut tracker = IncomeEvidenceTracker::open(Settings::rooted_at(Path::new("data")))?;
//! let summary = tracker.import_file(Path::new("income_2024.xlsx"), None, None)?;
//! println!("version {}: {} new", summary.version, summary.new_contract_ids.len());
//!
//! let unconfirmed = tracker.view(
//!     &FilterCriteria {
//!         difference_status: Some(DifferenceStatus::Unconfirmed),
//!         ..Default::default()
//!     },
//!     "",
//!     Some(("annual_confirmed_income", false)),
//! );
//! ```

pub mod attachment;
pub mod batch;
pub mod error;
pub mod query;
pub mod reconcile;
pub mod record;
pub mod settings;
pub mod spreadsheet;
pub mod store;

pub use attachment::{Attachment, AttachmentStorage, FileType, FsAttachmentStorage, StorageInfo};
pub use batch::{ImportBatch, ImportRequest, ImportRowError, ImportSummary};
pub use error::{IncomeEvidenceError, Result};
pub use query::{
    column_search, filter, group_by, group_by_name, search, sort, statistics, AttachmentStatus,
    ContractStatus, DifferenceStatus, FilterCriteria, FilterState, GroupField, RecordField,
    Statistics,
};
pub use reconcile::{CandidateRecord, Reconciler, MAX_REPORTED_ERRORS};
pub use record::{IncomeRecord, RecordEdit};
pub use settings::{BackupSettings, ImportSettings, Settings};
pub use spreadsheet::{parse_table, ColumnMapping, ParsedSheet, Table};
pub use store::{DeleteOutcome, RecordStore, StoreMetadata};

use log::{debug, info, warn};
use std::path::Path;

/// Ties the record store, attachment storage and spreadsheet adapter together
/// under one set of [`Settings`].
pub struct IncomeEvidenceTracker {
    settings: Settings,
    store: RecordStore,
    attachments: FsAttachmentStorage,
}

impl IncomeEvidenceTracker {
    pub fn open(settings: Settings) -> Result<Self> {
        let attachments = FsAttachmentStorage::new(&settings.attachment_root)?;
        let store = RecordStore::open(&settings.data_file)?
            .with_attachment_storage(Box::new(attachments.clone()));

        info!(
            "Opened tracker at {} with {} records",
            settings.data_file.display(),
            store.len()
        );

        Ok(Self {
            settings,
            store,
            attachments,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut RecordStore {
        &mut self.store
    }

    pub fn attachment_storage(&self) -> &FsAttachmentStorage {
        &self.attachments
    }

    /// Parses `table` with `mapping` and imports the rows as the next
    /// version. Rows the adapter could not read are reported alongside the
    /// rows the reconciler rejected.
    pub fn import_table(
        &mut self,
        table: &Table,
        mapping: &ColumnMapping,
        source: &str,
    ) -> Result<ImportSummary> {
        self.check_required_columns(table, mapping)?;

        let parsed = parse_table(table, mapping, self.settings.import.max_rows)?;
        debug!(
            "Parsed {} candidates and {} unreadable rows from '{}'",
            parsed.candidates.len(),
            parsed.errors.len(),
            source
        );

        if parsed.candidates.is_empty() {
            let mut messages: Vec<String> = parsed
                .errors
                .iter()
                .take(MAX_REPORTED_ERRORS)
                .map(ToString::to_string)
                .collect();
            if messages.is_empty() {
                messages.push("the sheet contains no data rows".to_string());
            }
            return Err(IncomeEvidenceError::ImportError {
                failed: parsed.errors.len(),
                messages,
            });
        }

        if self.settings.backup.auto_backup && !self.store.is_empty() {
            self.backup_before_import();
        }

        let request = ImportRequest::new(source).with_column_mapping(mapping.clone());
        match self.store.import_batch(parsed.candidates, request) {
            Ok(mut summary) => {
                summary.import_errors.extend(parsed.errors);
                summary.import_errors.sort_by_key(|e| e.row);
                Ok(summary)
            }
            Err(IncomeEvidenceError::ImportError { failed, messages }) => {
                let combined = parsed
                    .errors
                    .iter()
                    .map(ToString::to_string)
                    .chain(messages)
                    .take(MAX_REPORTED_ERRORS)
                    .collect();
                Err(IncomeEvidenceError::ImportError {
                    failed: failed + parsed.errors.len(),
                    messages: combined,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Reads a CSV or workbook file and imports it. Without an explicit
    /// mapping the columns are detected from the header row.
    pub fn import_file(
        &mut self,
        path: &Path,
        sheet: Option<&str>,
        mapping: Option<ColumnMapping>,
    ) -> Result<ImportSummary> {
        let table = Table::from_path(path, sheet)?;
        let mapping = match mapping {
            Some(mapping) => mapping,
            None => ColumnMapping::detect(&table.headers)?,
        };

        let source = match sheet {
            Some(sheet) => format!("{}#{}", path.display(), sheet),
            None => path.display().to_string(),
        };

        let summary = self.import_table(&table, &mapping, &source)?;
        self.settings.last_import_path = Some(path.to_path_buf());
        Ok(summary)
    }

    pub fn export_csv(&mut self, records: &[IncomeRecord], path: &Path) -> Result<()> {
        spreadsheet::export_csv(records, path)?;
        self.settings.last_export_path = Some(path.to_path_buf());
        Ok(())
    }

    /// Copies `source` into the contract's attachment folder and records it
    /// in the catalogue.
    pub fn attach_file(
        &mut self,
        contract_id: &str,
        source: &Path,
        custom_name: Option<&str>,
    ) -> Result<Attachment> {
        if !self.store.contains(contract_id) {
            return Err(IncomeEvidenceError::NotFound(contract_id.to_string()));
        }

        let stored = self.attachments.save(source, contract_id, custom_name)?;
        let attachment = Attachment::new(contract_id, source.to_string_lossy(), stored.clone());

        if let Err(e) = self.store.add_attachment(attachment.clone()) {
            if let Err(cleanup) = self.attachments.delete(&stored) {
                warn!("Could not remove orphaned file {}: {}", stored, cleanup);
            }
            return Err(e);
        }

        info!("Attached {} to contract {}", attachment.display_name(), contract_id);
        Ok(attachment)
    }

    pub fn remove_attachment(&mut self, attachment_id: &str) -> Result<bool> {
        self.store.delete_attachment(attachment_id)
    }

    /// Filter, then keyword search, then an optional `(field, ascending)`
    /// sort over the stored records.
    pub fn view(
        &self,
        criteria: &FilterCriteria,
        keyword: &str,
        sort_by: Option<(&str, bool)>,
    ) -> Vec<IncomeRecord> {
        let records = filter(&self.store.list_all(), criteria);
        let records = search(&records, keyword);
        match sort_by {
            Some((field, ascending)) => sort(&records, field, ascending),
            None => records,
        }
    }

    fn check_required_columns(&self, table: &Table, mapping: &ColumnMapping) -> Result<()> {
        let missing: Vec<&str> = self
            .settings
            .import
            .required_columns
            .iter()
            .map(String::as_str)
            .filter(|field| {
                mapping
                    .column_for(field)
                    .and_then(|column| table.column_index(column))
                    .is_none()
            })
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(IncomeEvidenceError::ParseError(format!(
                "required columns not present: {:?}; available columns: {:?}",
                missing, table.headers
            )))
        }
    }

    fn backup_before_import(&mut self) {
        let dir = self.settings.backup_dir.clone();
        match self.store.backup(&dir, None) {
            Ok(path) => {
                debug!("Pre-import backup at {}", path.display());
                if let Err(e) = RecordStore::prune_backups(&dir, self.settings.backup.max_backup_files) {
                    warn!("Failed to prune backups in {}: {}", dir.display(), e);
                }
            }
            Err(e) => warn!("Pre-import backup failed: {}", e),
        }
    }
}
