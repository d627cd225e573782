use crate::batch::{ImportBatch, ImportRequest, ImportRowError};
use crate::error::{IncomeEvidenceError, Result};
use crate::record::IncomeRecord;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How many row errors an all-rows-failed import reports.
pub const MAX_REPORTED_ERRORS: usize = 10;

/// An unvalidated row produced by the spreadsheet adapter (or any other
/// source). Carries no annotation history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Source row number, if the producer tracked one. Otherwise the 1-based
    /// position in the batch is used when reporting errors.
    #[serde(default)]
    pub row: Option<usize>,
    pub contract_id: String,
    pub client_name: String,
    pub annual_confirmed_income: Option<Decimal>,
    #[serde(default)]
    pub subject_entity: String,
    #[serde(default)]
    pub attachment_confirmed_income: Option<Decimal>,
}

impl CandidateRecord {
    pub fn new(
        contract_id: impl Into<String>,
        client_name: impl Into<String>,
        annual_confirmed_income: Decimal,
    ) -> Self {
        Self {
            contract_id: contract_id.into(),
            client_name: client_name.into(),
            annual_confirmed_income: Some(annual_confirmed_income),
            ..Default::default()
        }
    }

    pub fn into_record(self, import_time: DateTime<Utc>) -> Result<IncomeRecord> {
        let income = self.annual_confirmed_income.ok_or_else(|| {
            IncomeEvidenceError::validation(
                "annual_confirmed_income",
                "annual confirmed income is missing",
            )
        })?;

        let mut record = IncomeRecord::new(self.contract_id, self.client_name, income)?
            .with_subject_entity(self.subject_entity);
        record.set_attachment_confirmed_income(self.attachment_confirmed_income)?;
        record.import_time = import_time;
        Ok(record)
    }
}

/// Result of merging one batch; nothing has been written to the store yet.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Merged records keyed by contract id, ready to replace store entries.
    pub records: BTreeMap<String, IncomeRecord>,
    pub batch: ImportBatch,
    pub errors: Vec<ImportRowError>,
}

/// Carries the user's annotations from the stored record onto the incoming
/// one. A confirmed attachment income is never downgraded to unset just
/// because the new sheet had no value for it.
pub fn carry_forward_annotations(existing: &IncomeRecord, incoming: &mut IncomeRecord) {
    if existing.attachment_confirmed_income.is_some() {
        incoming.attachment_confirmed_income = existing.attachment_confirmed_income;
    }
    incoming.difference_note = existing.difference_note.clone();
    incoming.attached_file_paths = existing.attached_file_paths.clone();
}

/// Three-way merge of a stored record `existing` with a freshly imported
/// `incoming` one: business fields come from `incoming`, annotations from
/// `existing`, and the change markers are recomputed.
pub fn merge_with_existing(existing: &IncomeRecord, mut incoming: IncomeRecord) -> IncomeRecord {
    incoming.change_amount = incoming.income_delta_from(existing);
    carry_forward_annotations(existing, &mut incoming);
    incoming.is_new = false;

    if incoming.client_name != existing.client_name {
        debug!(
            "Contract {} client renamed: '{}' -> '{}'",
            incoming.contract_id, existing.client_name, incoming.client_name
        );
    }

    incoming
}

pub struct Reconciler<'a> {
    existing: &'a BTreeMap<String, IncomeRecord>,
    previous_version: u32,
}

impl<'a> Reconciler<'a> {
    pub fn new(existing: &'a BTreeMap<String, IncomeRecord>, previous_version: u32) -> Self {
        Self {
            existing,
            previous_version,
        }
    }

    pub fn reconcile(
        &self,
        candidates: Vec<CandidateRecord>,
        request: &ImportRequest,
    ) -> Result<ReconcileOutcome> {
        self.reconcile_at(candidates, request, Utc::now())
    }

    pub fn reconcile_at(
        &self,
        candidates: Vec<CandidateRecord>,
        request: &ImportRequest,
        import_time: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        if candidates.is_empty() {
            return Err(IncomeEvidenceError::ImportError {
                failed: 0,
                messages: vec!["the batch contains no rows".to_string()],
            });
        }

        let record_count = candidates.len();
        let version = self.previous_version + 1;

        info!(
            "Reconciling {} candidate rows from '{}' as version {}",
            record_count, request.source_descriptor, version
        );

        let mut records: BTreeMap<String, IncomeRecord> = BTreeMap::new();
        let mut errors = Vec::new();
        let mut new_contract_ids = BTreeSet::new();
        let mut changed_contract_ids = BTreeSet::new();

        for (idx, candidate) in candidates.into_iter().enumerate() {
            let row = candidate.row.unwrap_or(idx + 1);

            let incoming = match candidate.into_record(import_time) {
                Ok(record) => record,
                Err(e) => {
                    errors.push(ImportRowError {
                        row,
                        reason: row_reason(&e),
                    });
                    continue;
                }
            };

            let contract_id = incoming.contract_id.clone();

            let mut merged = match self.existing.get(&contract_id) {
                None => {
                    let mut fresh = incoming;
                    fresh.is_new = true;
                    fresh.change_amount = None;
                    new_contract_ids.insert(contract_id.clone());
                    fresh
                }
                Some(existing) => {
                    let merged = merge_with_existing(existing, incoming);
                    if merged.change_amount.is_some() {
                        changed_contract_ids.insert(contract_id.clone());
                    } else {
                        changed_contract_ids.remove(&contract_id);
                    }
                    merged
                }
            };
            merged.version = version;

            if records.insert(contract_id.clone(), merged).is_some() {
                warn!(
                    "Contract {} appears more than once in the batch; row {} replaces the earlier row",
                    contract_id, row
                );
            }
        }

        if records.is_empty() {
            let messages = errors
                .iter()
                .take(MAX_REPORTED_ERRORS)
                .map(ToString::to_string)
                .collect();
            return Err(IncomeEvidenceError::ImportError {
                failed: errors.len(),
                messages,
            });
        }

        if !errors.is_empty() {
            warn!(
                "{} of {} rows rejected during import: {:?}",
                errors.len(),
                record_count,
                errors.iter().take(5).map(ToString::to_string).collect::<Vec<_>>()
            );
        }

        debug!(
            "Reconciliation complete: {} new, {} changed, {} skipped",
            new_contract_ids.len(),
            changed_contract_ids.len(),
            errors.len()
        );

        let batch = ImportBatch {
            version,
            import_timestamp: import_time,
            source_descriptor: request.source_descriptor.clone(),
            column_mapping: request.column_mapping.clone(),
            record_count,
            skipped_rows: errors.len(),
            new_contract_ids,
            changed_contract_ids,
        };

        Ok(ReconcileOutcome {
            records,
            batch,
            errors,
        })
    }
}

fn row_reason(err: &IncomeEvidenceError) -> String {
    match err {
        IncomeEvidenceError::ValidationError { details, .. } => details.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn store_with(records: Vec<IncomeRecord>) -> BTreeMap<String, IncomeRecord> {
        records
            .into_iter()
            .map(|r| (r.contract_id.clone(), r))
            .collect()
    }

    #[test]
    fn test_empty_store_marks_everything_new() {
        let existing = BTreeMap::new();
        let outcome = Reconciler::new(&existing, 0)
            .reconcile(
                vec![
                    CandidateRecord::new("C1", "Acme", dec!(1000)),
                    CandidateRecord::new("C2", "Globex", dec!(500)),
                ],
                &ImportRequest::new("first.csv"),
            )
            .unwrap();

        assert!(outcome.records.values().all(|r| r.is_new && r.version == 1));
        assert!(outcome.batch.changed_contract_ids.is_empty());
        assert_eq!(outcome.batch.new_contract_ids.len(), 2);
    }

    #[test]
    fn test_merge_preserves_annotations() {
        let mut existing = IncomeRecord::new("C1", "Acme", dec!(1000))
            .unwrap()
            .with_attachment_confirmed_income(dec!(900))
            .unwrap()
            .with_difference_note("freight");
        existing.add_attached_file("C1/a.pdf");
        existing.is_new = true;

        let incoming = IncomeRecord::new("C1", "Acme Ltd", dec!(1200)).unwrap();
        let merged = merge_with_existing(&existing, incoming);

        assert_eq!(merged.client_name, "Acme Ltd");
        assert_eq!(merged.annual_confirmed_income, dec!(1200));
        assert_eq!(merged.attachment_confirmed_income, Some(dec!(900)));
        assert_eq!(merged.difference_note, "freight");
        assert_eq!(merged.attached_file_paths, vec!["C1/a.pdf".to_string()]);
        assert_eq!(merged.change_amount, Some(dec!(200)));
        assert!(!merged.is_new);
    }

    #[test]
    fn test_sheet_value_kept_when_nothing_confirmed_yet() {
        let existing = IncomeRecord::new("C1", "Acme", dec!(1000)).unwrap();
        let incoming = IncomeRecord::new("C1", "Acme", dec!(1000))
            .unwrap()
            .with_attachment_confirmed_income(dec!(750))
            .unwrap();

        let merged = merge_with_existing(&existing, incoming);
        assert_eq!(merged.attachment_confirmed_income, Some(dec!(750)));
        assert_eq!(merged.change_amount, None);
    }

    #[test]
    fn test_partial_failure_collects_row_errors() {
        let existing = BTreeMap::new();
        let candidates = vec![
            CandidateRecord::new("C1", "Acme", dec!(1)),
            CandidateRecord::new("", "Nobody", dec!(1)),
            CandidateRecord::new("C3", "Initech", dec!(1)),
            CandidateRecord::new("", "Nobody", dec!(1)),
            CandidateRecord::new("C5", "Umbrella", dec!(1)),
        ];

        let outcome = Reconciler::new(&existing, 0)
            .reconcile(candidates, &ImportRequest::new("mixed.csv"))
            .unwrap();

        assert_eq!(outcome.records.len(), 3);
        let rows: Vec<usize> = outcome.errors.iter().map(|e| e.row).collect();
        assert_eq!(rows, vec![2, 4]);
        assert_eq!(outcome.batch.record_count, 5);
        assert_eq!(outcome.batch.imported_count(), 3);
    }

    #[test]
    fn test_all_rows_failing_is_an_import_error() {
        let existing = BTreeMap::new();
        let candidates: Vec<CandidateRecord> = (0..12)
            .map(|_| CandidateRecord::new("", "x", dec!(1)))
            .collect();

        let err = Reconciler::new(&existing, 0)
            .reconcile(candidates, &ImportRequest::new("bad.csv"))
            .unwrap_err();

        match err {
            IncomeEvidenceError::ImportError { failed, messages } => {
                assert_eq!(failed, 12);
                assert_eq!(messages.len(), MAX_REPORTED_ERRORS);
                assert!(messages[0].starts_with("row 1:"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_rows_in_batch_last_wins() {
        let existing = store_with(vec![IncomeRecord::new("C1", "Acme", dec!(1000)).unwrap()]);
        let outcome = Reconciler::new(&existing, 1)
            .reconcile(
                vec![
                    CandidateRecord::new("C1", "Acme", dec!(1500)),
                    CandidateRecord::new("C1", "Acme", dec!(1000)),
                ],
                &ImportRequest::new("dupes.csv"),
            )
            .unwrap();

        let merged = &outcome.records["C1"];
        assert_eq!(merged.annual_confirmed_income, dec!(1000));
        assert_eq!(merged.change_amount, None);
        assert!(outcome.batch.changed_contract_ids.is_empty());
        assert_eq!(merged.version, 2);
    }

    #[test]
    fn test_missing_income_is_rejected() {
        let existing = BTreeMap::new();
        let candidate = CandidateRecord {
            row: Some(7),
            contract_id: "C1".to_string(),
            client_name: "Acme".to_string(),
            ..Default::default()
        };
        let outcome = Reconciler::new(&existing, 0)
            .reconcile(
                vec![candidate, CandidateRecord::new("C2", "Acme", dec!(5))],
                &ImportRequest::new("sheet"),
            )
            .unwrap();

        assert_eq!(outcome.errors[0].row, 7);
        assert!(outcome.errors[0].reason.contains("missing"));
    }
}
