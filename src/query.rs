//! Read-only views over record lists: filtering, search, sorting, grouping
//! and summary statistics. Nothing here mutates its input.

use crate::error::IncomeEvidenceError;
use crate::record::IncomeRecord;
use log::warn;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceStatus {
    HasDifference,
    NoDifference,
    Unconfirmed,
}

impl DifferenceStatus {
    pub fn of(record: &IncomeRecord) -> Self {
        match record.difference() {
            None => Self::Unconfirmed,
            Some(d) if d.is_zero() => Self::NoDifference,
            Some(_) => Self::HasDifference,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HasDifference => "has_difference",
            Self::NoDifference => "no_difference",
            Self::Unconfirmed => "unconfirmed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStatus {
    Linked,
    Unlinked,
}

impl AttachmentStatus {
    pub fn of(record: &IncomeRecord) -> Self {
        if record.attachment_count() > 0 {
            Self::Linked
        } else {
            Self::Unlinked
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linked => "linked",
            Self::Unlinked => "unlinked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    New,
    Existing,
}

impl ContractStatus {
    pub fn of(record: &IncomeRecord) -> Self {
        if record.is_new {
            Self::New
        } else {
            Self::Existing
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Existing => "existing",
        }
    }
}

/// The recognized filter options. Every `None` is a no-op; set options are
/// combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterCriteria {
    #[serde(default)]
    pub difference_status: Option<DifferenceStatus>,
    #[serde(default)]
    pub attachment_status: Option<AttachmentStatus>,
    #[serde(default)]
    pub contract_status: Option<ContractStatus>,
    #[serde(default)]
    pub subject_entity: Option<String>,
    #[serde(default)]
    pub client_name_contains: Option<String>,
    #[serde(default)]
    pub contract_id_contains: Option<String>,
    #[serde(default)]
    pub min_income: Option<Decimal>,
    #[serde(default)]
    pub max_income: Option<Decimal>,
}

impl FilterCriteria {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn matches(&self, record: &IncomeRecord) -> bool {
        if let Some(status) = self.difference_status {
            if DifferenceStatus::of(record) != status {
                return false;
            }
        }
        if let Some(status) = self.attachment_status {
            if AttachmentStatus::of(record) != status {
                return false;
            }
        }
        if let Some(status) = self.contract_status {
            if ContractStatus::of(record) != status {
                return false;
            }
        }
        if let Some(entity) = &self.subject_entity {
            if &record.subject_entity != entity {
                return false;
            }
        }
        if let Some(needle) = &self.client_name_contains {
            if !contains_ignore_case(&record.client_name, needle) {
                return false;
            }
        }
        if let Some(needle) = &self.contract_id_contains {
            if !contains_ignore_case(&record.contract_id, needle) {
                return false;
            }
        }
        if let Some(min) = self.min_income {
            if record.annual_confirmed_income < min {
                return false;
            }
        }
        if let Some(max) = self.max_income {
            if record.annual_confirmed_income > max {
                return false;
            }
        }
        true
    }
}

/// Saved UI filter state, persisted with the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterState {
    pub criteria: FilterCriteria,
    #[serde(default)]
    pub keyword: String,
    /// Per-column search terms keyed by column name.
    #[serde(default)]
    pub column_search: BTreeMap<String, String>,
    #[serde(default)]
    pub sort: Option<(String, bool)>,
}

/// Record fields that can be sorted on or searched by column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    ContractId,
    ClientName,
    SubjectEntity,
    AnnualConfirmedIncome,
    AttachmentConfirmedIncome,
    Difference,
    DifferenceNote,
    AttachmentCount,
    ImportTime,
    ChangeAmount,
}

impl RecordField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContractId => "contract_id",
            Self::ClientName => "client_name",
            Self::SubjectEntity => "subject_entity",
            Self::AnnualConfirmedIncome => "annual_confirmed_income",
            Self::AttachmentConfirmedIncome => "attachment_confirmed_income",
            Self::Difference => "difference",
            Self::DifferenceNote => "difference_note",
            Self::AttachmentCount => "attachment_count",
            Self::ImportTime => "import_time",
            Self::ChangeAmount => "change_amount",
        }
    }

    /// Display text of the field, as used by column search.
    pub fn text_of(&self, record: &IncomeRecord) -> String {
        let opt = |d: Option<Decimal>| d.map(|d| d.to_string()).unwrap_or_default();
        match self {
            Self::ContractId => record.contract_id.clone(),
            Self::ClientName => record.client_name.clone(),
            Self::SubjectEntity => record.subject_entity.clone(),
            Self::AnnualConfirmedIncome => record.annual_confirmed_income.to_string(),
            Self::AttachmentConfirmedIncome => opt(record.attachment_confirmed_income),
            Self::Difference => opt(record.difference()),
            Self::DifferenceNote => record.difference_note.clone(),
            Self::AttachmentCount => record.attachment_count().to_string(),
            Self::ImportTime => record.import_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            Self::ChangeAmount => opt(record.change_amount),
        }
    }

    fn compare(&self, a: &IncomeRecord, b: &IncomeRecord) -> Ordering {
        let zero = |d: Option<Decimal>| d.unwrap_or(Decimal::ZERO);
        match self {
            Self::ContractId => a.contract_id.cmp(&b.contract_id),
            Self::ClientName => a.client_name.cmp(&b.client_name),
            Self::SubjectEntity => a.subject_entity.cmp(&b.subject_entity),
            Self::AnnualConfirmedIncome => a.annual_confirmed_income.cmp(&b.annual_confirmed_income),
            Self::AttachmentConfirmedIncome => {
                zero(a.attachment_confirmed_income).cmp(&zero(b.attachment_confirmed_income))
            }
            Self::Difference => zero(a.difference()).cmp(&zero(b.difference())),
            Self::DifferenceNote => a.difference_note.cmp(&b.difference_note),
            Self::AttachmentCount => a.attachment_count().cmp(&b.attachment_count()),
            Self::ImportTime => a.import_time.cmp(&b.import_time),
            Self::ChangeAmount => zero(a.change_amount).cmp(&zero(b.change_amount)),
        }
    }
}

impl fmt::Display for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let field = match s.trim() {
            "contract_id" | "合同号" => Self::ContractId,
            "client_name" | "客户名" => Self::ClientName,
            "subject_entity" | "收入主体" => Self::SubjectEntity,
            "annual_confirmed_income" | "本年确认的收入" => Self::AnnualConfirmedIncome,
            "attachment_confirmed_income" | "附件确认的收入" => Self::AttachmentConfirmedIncome,
            "difference" | "差异" => Self::Difference,
            "difference_note" | "差异备注" => Self::DifferenceNote,
            "attachment_count" | "附件数量" => Self::AttachmentCount,
            "import_time" | "导入时间" => Self::ImportTime,
            "change_amount" | "变化金额" => Self::ChangeAmount,
            other => return Err(format!("unknown record field '{}'", other)),
        };
        Ok(field)
    }
}

/// Grouping keys for [`group_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupField {
    ClientName,
    SubjectEntity,
    ContractStatus,
    DifferenceStatus,
    AttachmentStatus,
}

impl GroupField {
    fn key_of(&self, record: &IncomeRecord) -> String {
        match self {
            Self::ClientName => record.client_name.clone(),
            Self::SubjectEntity => record.subject_entity.clone(),
            Self::ContractStatus => ContractStatus::of(record).as_str().to_string(),
            Self::DifferenceStatus => DifferenceStatus::of(record).as_str().to_string(),
            Self::AttachmentStatus => AttachmentStatus::of(record).as_str().to_string(),
        }
    }
}

impl FromStr for GroupField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "client_name" => Ok(Self::ClientName),
            "subject_entity" => Ok(Self::SubjectEntity),
            "contract_status" => Ok(Self::ContractStatus),
            "difference_status" => Ok(Self::DifferenceStatus),
            "attachment_status" => Ok(Self::AttachmentStatus),
            other => Err(format!("unknown group field '{}'", other)),
        }
    }
}

/// Aggregate view over any set of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_count: usize,
    pub total_income: Decimal,
    pub average_income: Decimal,
    pub max_income: Decimal,
    pub min_income: Decimal,
    pub confirmed_count: usize,
    pub confirmed_income: Decimal,
    /// Confirmed income as a percentage of total income, to 2 decimal places.
    pub evidence_ratio: Decimal,
    pub with_difference: usize,
    pub without_difference: usize,
    pub average_difference: Decimal,
    pub max_difference: Decimal,
    pub min_difference: Decimal,
    pub with_attachments: usize,
    pub without_attachments: usize,
    pub new_contracts: usize,
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

pub fn filter(records: &[IncomeRecord], criteria: &FilterCriteria) -> Vec<IncomeRecord> {
    records
        .iter()
        .filter(|r| criteria.matches(r))
        .cloned()
        .collect()
}

/// Case-insensitive keyword search over contract id, client, note and both
/// income amounts. An empty keyword returns everything.
pub fn search(records: &[IncomeRecord], keyword: &str) -> Vec<IncomeRecord> {
    if keyword.is_empty() {
        return records.to_vec();
    }

    let keyword = keyword.to_lowercase();
    records
        .iter()
        .filter(|r| {
            [
                RecordField::ContractId,
                RecordField::ClientName,
                RecordField::DifferenceNote,
                RecordField::AnnualConfirmedIncome,
                RecordField::AttachmentConfirmedIncome,
            ]
            .iter()
            .any(|field| field.text_of(r).to_lowercase().contains(&keyword))
        })
        .cloned()
        .collect()
}

/// Keyword search restricted to one column.
pub fn column_search(records: &[IncomeRecord], field: RecordField, keyword: &str) -> Vec<IncomeRecord> {
    if keyword.is_empty() {
        return records.to_vec();
    }
    records
        .iter()
        .filter(|r| contains_ignore_case(&field.text_of(r), keyword))
        .cloned()
        .collect()
}

/// Stable sort by a named field. Unknown names leave the order untouched.
pub fn sort(records: &[IncomeRecord], field: &str, ascending: bool) -> Vec<IncomeRecord> {
    match field.parse::<RecordField>() {
        Ok(field) => sort_by_field(records, field, ascending),
        Err(e) => {
            warn!("Unsupported sort field: {}", e);
            records.to_vec()
        }
    }
}

pub fn sort_by_field(records: &[IncomeRecord], field: RecordField, ascending: bool) -> Vec<IncomeRecord> {
    let mut sorted = records.to_vec();
    if ascending {
        sorted.sort_by(|a, b| field.compare(a, b));
    } else {
        sorted.sort_by(|a, b| field.compare(b, a));
    }
    sorted
}

pub fn group_by(records: &[IncomeRecord], field: GroupField) -> BTreeMap<String, Vec<IncomeRecord>> {
    let mut groups: BTreeMap<String, Vec<IncomeRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry(field.key_of(record))
            .or_default()
            .push(record.clone());
    }
    groups
}

/// String entry point for [`group_by`]; unknown field names put everything
/// under `"other"`.
pub fn group_by_name(records: &[IncomeRecord], field: &str) -> BTreeMap<String, Vec<IncomeRecord>> {
    match field.parse::<GroupField>() {
        Ok(field) => group_by(records, field),
        Err(e) => {
            warn!("{}", e);
            let mut groups = BTreeMap::new();
            if !records.is_empty() {
                groups.insert("other".to_string(), records.to_vec());
            }
            groups
        }
    }
}

/// Aggregates over `records`. Sums that leave the decimal range are reported
/// as [`IncomeEvidenceError::ArithmeticOverflow`].
pub fn statistics(records: &[IncomeRecord]) -> crate::error::Result<Statistics> {
    if records.is_empty() {
        return Ok(Statistics::default());
    }

    let mut stats = Statistics {
        total_count: records.len(),
        max_income: records[0].annual_confirmed_income,
        min_income: records[0].annual_confirmed_income,
        ..Default::default()
    };

    let mut differences = Vec::new();

    for record in records {
        let income = record.annual_confirmed_income;
        stats.total_income = checked(stats.total_income.checked_add(income), "total income")?;
        stats.max_income = stats.max_income.max(income);
        stats.min_income = stats.min_income.min(income);

        if let Some(confirmed) = record.attachment_confirmed_income {
            stats.confirmed_count += 1;
            stats.confirmed_income =
                checked(stats.confirmed_income.checked_add(confirmed), "confirmed income")?;
        }

        if let Some(difference) = record.difference() {
            if difference.is_zero() {
                stats.without_difference += 1;
            } else {
                stats.with_difference += 1;
            }
            differences.push(difference);
        }

        if record.attachment_count() > 0 {
            stats.with_attachments += 1;
        } else {
            stats.without_attachments += 1;
        }

        if record.is_new {
            stats.new_contracts += 1;
        }
    }

    stats.average_income = checked(
        stats.total_income.checked_div(Decimal::from(records.len())),
        "average income",
    )?;

    if stats.total_income > Decimal::ZERO {
        let ratio = stats
            .confirmed_income
            .checked_div(stats.total_income)
            .and_then(|r| r.checked_mul(Decimal::ONE_HUNDRED));
        stats.evidence_ratio = checked(ratio, "evidence ratio")?.round_dp(2);
    }

    if let (Some(max), Some(min)) = (differences.iter().max(), differences.iter().min()) {
        stats.max_difference = *max;
        stats.min_difference = *min;
        let sum = differences
            .iter()
            .try_fold(Decimal::ZERO, |acc, d| acc.checked_add(*d));
        let sum = checked(sum, "total difference")?;
        stats.average_difference = checked(
            sum.checked_div(Decimal::from(differences.len())),
            "average difference",
        )?;
    }

    Ok(stats)
}

fn checked(value: Option<Decimal>, what: &str) -> crate::error::Result<Decimal> {
    value.ok_or_else(|| {
        IncomeEvidenceError::ArithmeticOverflow(format!("{} exceeds the decimal range", what))
    })
}
