use crate::error::{IncomeEvidenceError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys added by [`IncomeRecord::to_dict`] that are computed, never stored.
pub const DERIVED_KEYS: [&str; 3] = ["difference", "attachment_count", "change_status"];

/// One contract's income reconciliation state.
///
/// Business fields come from the imported spreadsheet. Annotation fields
/// (`attachment_confirmed_income`, `difference_note`, `attached_file_paths`)
/// belong to the user and survive re-imports. Change-tracking fields are only
/// written by the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomeRecord {
    pub contract_id: String,
    pub client_name: String,
    #[serde(default)]
    pub subject_entity: String,
    pub annual_confirmed_income: Decimal,

    #[serde(default)]
    pub attachment_confirmed_income: Option<Decimal>,
    #[serde(default)]
    pub difference_note: String,
    #[serde(default)]
    pub attached_file_paths: Vec<String>,

    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub change_amount: Option<Decimal>,
    #[serde(default = "default_version")]
    pub version: u32,
    pub import_time: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

/// A partial edit made directly by the user. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordEdit {
    pub client_name: Option<String>,
    pub subject_entity: Option<String>,
    pub annual_confirmed_income: Option<Decimal>,
    /// `Some(None)` clears the confirmed amount.
    pub attachment_confirmed_income: Option<Option<Decimal>>,
    pub difference_note: Option<String>,
}

impl IncomeRecord {
    pub fn new(
        contract_id: impl Into<String>,
        client_name: impl Into<String>,
        annual_confirmed_income: Decimal,
    ) -> Result<Self> {
        let record = Self {
            contract_id: contract_id.into(),
            client_name: client_name.into(),
            subject_entity: String::new(),
            annual_confirmed_income,
            attachment_confirmed_income: None,
            difference_note: String::new(),
            attached_file_paths: Vec::new(),
            is_new: false,
            change_amount: None,
            version: default_version(),
            import_time: Utc::now(),
        };
        record.validate()?;
        Ok(record)
    }

    pub fn with_subject_entity(mut self, subject_entity: impl Into<String>) -> Self {
        self.subject_entity = subject_entity.into();
        self
    }

    pub fn with_difference_note(mut self, note: impl Into<String>) -> Self {
        self.difference_note = note.into();
        self
    }

    pub fn with_attachment_confirmed_income(mut self, amount: Decimal) -> Result<Self> {
        self.set_attachment_confirmed_income(Some(amount))?;
        Ok(self)
    }

    pub fn set_attachment_confirmed_income(&mut self, amount: Option<Decimal>) -> Result<()> {
        if let Some(value) = amount {
            check_attachment_income(value)?;
        }
        self.attachment_confirmed_income = amount;
        Ok(())
    }

    /// Checks every invariant a stored record must hold.
    pub fn validate(&self) -> Result<()> {
        if self.contract_id.trim().is_empty() {
            return Err(IncomeEvidenceError::validation(
                "contract_id",
                "contract id must not be empty",
            ));
        }

        if self.client_name.trim().is_empty() {
            return Err(IncomeEvidenceError::validation(
                "client_name",
                format!("client name must not be empty (contract {})", self.contract_id),
            ));
        }

        if self.annual_confirmed_income <= Decimal::ZERO {
            return Err(IncomeEvidenceError::validation(
                "annual_confirmed_income",
                format!(
                    "annual confirmed income must be greater than 0, got {}",
                    self.annual_confirmed_income
                ),
            ));
        }

        if let Some(value) = self.attachment_confirmed_income {
            check_attachment_income(value)?;
        }

        for (idx, path) in self.attached_file_paths.iter().enumerate() {
            if self.attached_file_paths[..idx].contains(path) {
                return Err(IncomeEvidenceError::validation(
                    "attached_file_paths",
                    format!("duplicate attached file '{}'", path),
                ));
            }
        }

        Ok(())
    }

    /// Annual confirmed income minus attachment-confirmed income, when the
    /// latter has been entered.
    pub fn difference(&self) -> Option<Decimal> {
        self.attachment_confirmed_income
            .map(|confirmed| self.annual_confirmed_income - confirmed)
    }

    pub fn attachment_count(&self) -> usize {
        self.attached_file_paths.len()
    }

    pub fn change_status(&self) -> String {
        if self.is_new {
            return "new".to_string();
        }
        match self.change_amount {
            Some(amount) if amount > Decimal::ZERO => format!("increased by {}", amount),
            Some(amount) if amount < Decimal::ZERO => format!("decreased by {}", amount.abs()),
            _ => String::new(),
        }
    }

    /// Income delta relative to an earlier state of the same contract, or
    /// `None` when the amounts are equal.
    pub fn income_delta_from(&self, previous: &IncomeRecord) -> Option<Decimal> {
        if self.annual_confirmed_income == previous.annual_confirmed_income {
            None
        } else {
            Some(self.annual_confirmed_income - previous.annual_confirmed_income)
        }
    }

    /// Returns `false` when the path was already attached.
    pub fn add_attached_file(&mut self, path: impl Into<String>) -> bool {
        let path = path.into();
        if self.attached_file_paths.contains(&path) {
            return false;
        }
        self.attached_file_paths.push(path);
        true
    }

    /// Returns `false` when the path was not attached.
    pub fn remove_attached_file(&mut self, path: &str) -> bool {
        match self.attached_file_paths.iter().position(|p| p == path) {
            Some(idx) => {
                self.attached_file_paths.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Applies a user edit. Nothing changes if the edited record would be invalid.
    pub fn apply_edit(&mut self, edit: &RecordEdit) -> Result<()> {
        let mut edited = self.clone();

        if let Some(name) = &edit.client_name {
            edited.client_name = name.clone();
        }
        if let Some(entity) = &edit.subject_entity {
            edited.subject_entity = entity.clone();
        }
        if let Some(income) = edit.annual_confirmed_income {
            edited.annual_confirmed_income = income;
        }
        if let Some(confirmed) = edit.attachment_confirmed_income {
            edited.attachment_confirmed_income = confirmed;
        }
        if let Some(note) = &edit.difference_note {
            edited.difference_note = note.clone();
        }

        edited.validate()?;
        *self = edited;
        Ok(())
    }

    /// Plain key-value form with stable field names, plus the derived fields.
    pub fn to_dict(&self) -> Result<Map<String, Value>> {
        let mut map = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            other => {
                return Err(IncomeEvidenceError::PersistenceError(format!(
                    "record {} serialized to a non-object value: {}",
                    self.contract_id, other
                )))
            }
        };

        map.insert(
            "difference".to_string(),
            self.difference()
                .map(|d| Value::String(d.to_string()))
                .unwrap_or(Value::Null),
        );
        map.insert(
            "attachment_count".to_string(),
            Value::from(self.attachment_count()),
        );
        map.insert(
            "change_status".to_string(),
            Value::String(self.change_status()),
        );

        Ok(map)
    }

    /// Rebuilds a record from [`to_dict`](Self::to_dict) output. Derived keys
    /// are ignored and every invariant is re-checked.
    pub fn from_dict(dict: &Map<String, Value>) -> Result<Self> {
        let mut stored = dict.clone();
        for key in DERIVED_KEYS {
            stored.remove(key);
        }

        let record: IncomeRecord = serde_json::from_value(Value::Object(stored))?;
        record.validate()?;
        Ok(record)
    }
}

fn check_attachment_income(value: Decimal) -> Result<()> {
    if value < Decimal::ZERO {
        return Err(IncomeEvidenceError::validation(
            "attachment_confirmed_income",
            format!("attachment confirmed income must not be negative, got {}", value),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn field_of(err: IncomeEvidenceError) -> String {
        match err {
            IncomeEvidenceError::ValidationError { field, .. } => field,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_construction_validates_fields() {
        assert!(IncomeRecord::new("C1", "Acme", dec!(1000)).is_ok());

        let err = IncomeRecord::new("", "Acme", dec!(1000)).unwrap_err();
        assert_eq!(field_of(err), "contract_id");

        let err = IncomeRecord::new("C1", "   ", dec!(1000)).unwrap_err();
        assert_eq!(field_of(err), "client_name");

        let err = IncomeRecord::new("C1", "Acme", dec!(0)).unwrap_err();
        assert_eq!(field_of(err), "annual_confirmed_income");

        let err = IncomeRecord::new("C1", "Acme", dec!(100))
            .unwrap()
            .with_attachment_confirmed_income(dec!(-0.01))
            .unwrap_err();
        assert_eq!(field_of(err), "attachment_confirmed_income");
    }

    #[test]
    fn test_difference_is_derived() {
        let record = IncomeRecord::new("C1", "Acme", dec!(1000.50)).unwrap();
        assert_eq!(record.difference(), None);

        let record = record.with_attachment_confirmed_income(dec!(800.25)).unwrap();
        assert_eq!(record.difference(), Some(dec!(200.25)));
    }

    #[test]
    fn test_change_status_labels() {
        let mut record = IncomeRecord::new("C1", "Acme", dec!(1000)).unwrap();
        assert_eq!(record.change_status(), "");

        record.change_amount = Some(dec!(200));
        assert_eq!(record.change_status(), "increased by 200");

        record.change_amount = Some(dec!(-50.5));
        assert_eq!(record.change_status(), "decreased by 50.5");

        record.change_amount = Some(dec!(0));
        assert_eq!(record.change_status(), "");

        record.is_new = true;
        assert_eq!(record.change_status(), "new");
    }

    #[test]
    fn test_attached_files_are_idempotent() {
        let mut record = IncomeRecord::new("C1", "Acme", dec!(1000)).unwrap();

        assert!(record.add_attached_file("C1/invoice.pdf"));
        assert!(!record.add_attached_file("C1/invoice.pdf"));
        assert_eq!(record.attachment_count(), 1);

        assert!(record.remove_attached_file("C1/invoice.pdf"));
        assert!(!record.remove_attached_file("C1/invoice.pdf"));
        assert_eq!(record.attachment_count(), 0);
    }

    #[test]
    fn test_dict_round_trip() {
        let mut record = IncomeRecord::new("HT-2024-001", "Acme", dec!(1234.56))
            .unwrap()
            .with_subject_entity("Shanghai Branch")
            .with_difference_note("awaiting stamped invoice")
            .with_attachment_confirmed_income(dec!(1000))
            .unwrap();
        record.add_attached_file("HT-2024-001/contract.pdf");
        record.change_amount = Some(dec!(-10));
        record.version = 3;

        let dict = record.to_dict().unwrap();
        assert_eq!(dict["contract_id"], "HT-2024-001");
        assert_eq!(dict["difference"], "234.56");
        assert_eq!(dict["attachment_count"], 1);
        assert_eq!(dict["change_status"], "decreased by 10");

        let rebuilt = IncomeRecord::from_dict(&dict).unwrap();
        assert_eq!(rebuilt, record);
    }

    #[test]
    fn test_from_dict_rejects_invalid_values() {
        let record = IncomeRecord::new("C1", "Acme", dec!(1000)).unwrap();
        let mut dict = record.to_dict().unwrap();
        dict.insert(
            "attached_file_paths".to_string(),
            serde_json::json!(["a.pdf", "a.pdf"]),
        );

        let err = IncomeRecord::from_dict(&dict).unwrap_err();
        assert_eq!(field_of(err), "attached_file_paths");
    }

    #[test]
    fn test_apply_edit_is_all_or_nothing() {
        let mut record = IncomeRecord::new("C1", "Acme", dec!(1000)).unwrap();

        let bad = RecordEdit {
            difference_note: Some("should not stick".to_string()),
            annual_confirmed_income: Some(dec!(-1)),
            ..Default::default()
        };
        assert!(record.apply_edit(&bad).is_err());
        assert_eq!(record.difference_note, "");
        assert_eq!(record.annual_confirmed_income, dec!(1000));

        let good = RecordEdit {
            attachment_confirmed_income: Some(Some(dec!(900))),
            difference_note: Some("freight deducted".to_string()),
            ..Default::default()
        };
        record.apply_edit(&good).unwrap();
        assert_eq!(record.difference(), Some(dec!(100)));

        let clear = RecordEdit {
            attachment_confirmed_income: Some(None),
            ..Default::default()
        };
        record.apply_edit(&clear).unwrap();
        assert_eq!(record.difference(), None);
    }

    #[test]
    fn test_income_delta() {
        let old = IncomeRecord::new("C1", "Acme", dec!(1000)).unwrap();
        let new = IncomeRecord::new("C1", "Acme", dec!(1200)).unwrap();
        assert_eq!(new.income_delta_from(&old), Some(dec!(200)));
        assert_eq!(old.income_delta_from(&old), None);
    }
}
