//! Spreadsheet adapter: raw tabular input to candidate rows, and records back
//! out to a flat CSV file.
//!
//! Parsing never validates business rules beyond "is the cell there and is the
//! number a number"; the reconciler owns record validation.

use crate::batch::ImportRowError;
use crate::error::{IncomeEvidenceError, Result};
use crate::reconcile::CandidateRecord;
use crate::record::IncomeRecord;
use chrono::Local;
use csv::{ReaderBuilder, WriterBuilder};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

pub const DEFAULT_MAX_ROWS: usize = 10_000;

const CONTRACT_KEYWORDS: &[&str] = &["合同号", "合同编号", "契约号", "contract"];
const CLIENT_KEYWORDS: &[&str] = &["客户名", "客户名称", "公司名称", "企业名称", "client", "company"];
const ATTACHMENT_INCOME_KEYWORDS: &[&str] = &["附件确认的收入", "附件收入", "证明收入", "attachment"];
const SUBJECT_KEYWORDS: &[&str] = &["收入主体", "所属主体", "主体", "entity"];
const INCOME_KEYWORDS: &[&str] = &["本年确认的收入", "确认收入", "收入金额", "年度收入", "income", "revenue"];

/// Which source column feeds which record field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ColumnMapping {
    #[schemars(description = "Source column holding the contract id")]
    pub contract_id: String,

    #[schemars(description = "Source column holding the client name")]
    pub client_name: String,

    #[schemars(description = "Source column holding this year's confirmed income")]
    pub annual_confirmed_income: String,

    #[serde(default)]
    #[schemars(description = "Optional source column holding the income's subject entity")]
    pub subject_entity: Option<String>,

    #[serde(default)]
    #[schemars(description = "Optional source column holding attachment-confirmed income")]
    pub attachment_confirmed_income: Option<String>,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            contract_id: "合同号".to_string(),
            client_name: "客户名".to_string(),
            annual_confirmed_income: "本年确认的收入".to_string(),
            subject_entity: Some("收入主体".to_string()),
            attachment_confirmed_income: Some("附件确认的收入".to_string()),
        }
    }
}

impl ColumnMapping {
    /// Source column mapped to a logical field name, if any.
    pub fn column_for(&self, field: &str) -> Option<&str> {
        match field {
            "contract_id" => Some(self.contract_id.as_str()),
            "client_name" => Some(self.client_name.as_str()),
            "annual_confirmed_income" => Some(self.annual_confirmed_income.as_str()),
            "subject_entity" => self.subject_entity.as_deref(),
            "attachment_confirmed_income" => self.attachment_confirmed_income.as_deref(),
            _ => None,
        }
    }

    /// Guesses the mapping from header names by keyword. Fails if any
    /// required field has no matching column.
    pub fn detect(headers: &[String]) -> Result<Self> {
        let mut contract_id = None;
        let mut client_name = None;
        let mut income = None;
        let mut subject_entity = None;
        let mut attachment_income = None;

        for header in headers {
            let key = header.trim().to_lowercase();
            let matches = |keywords: &[&str]| keywords.iter().any(|k| key.contains(k));

            if contract_id.is_none() && matches(CONTRACT_KEYWORDS) {
                contract_id = Some(header.clone());
            } else if client_name.is_none() && matches(CLIENT_KEYWORDS) {
                client_name = Some(header.clone());
            } else if attachment_income.is_none() && matches(ATTACHMENT_INCOME_KEYWORDS) {
                attachment_income = Some(header.clone());
            } else if subject_entity.is_none() && matches(SUBJECT_KEYWORDS) {
                subject_entity = Some(header.clone());
            } else if income.is_none() && matches(INCOME_KEYWORDS) {
                income = Some(header.clone());
            }
        }

        match (contract_id, client_name, income) {
            (Some(contract_id), Some(client_name), Some(annual_confirmed_income)) => {
                let mapping = Self {
                    contract_id,
                    client_name,
                    annual_confirmed_income,
                    subject_entity,
                    attachment_confirmed_income: attachment_income,
                };
                debug!("Detected column mapping: {:?}", mapping);
                Ok(mapping)
            }
            (contract_id, client_name, income) => {
                let mut missing = Vec::new();
                if contract_id.is_none() {
                    missing.push("contract_id");
                }
                if client_name.is_none() {
                    missing.push("client_name");
                }
                if income.is_none() {
                    missing.push("annual_confirmed_income");
                }
                Err(IncomeEvidenceError::ParseError(format!(
                    "could not detect columns for {:?}; available columns: {:?}",
                    missing, headers
                )))
            }
        }
    }
}

/// A raw grid of cell strings with a header row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);

        let headers = rdr
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for rec in rdr.records() {
            let rec = rec?;
            rows.push(rec.iter().map(str::to_string).collect());
        }

        Ok(Self::new(headers, rows))
    }

    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_csv_reader(file)
    }

    /// Reads one worksheet (the first when `sheet` is `None`).
    #[cfg(feature = "excel")]
    pub fn from_excel_path(path: &Path, sheet: Option<&str>) -> Result<Self> {
        use calamine::{open_workbook_auto, Reader};

        let mut workbook = open_workbook_auto(path).map_err(|e| {
            IncomeEvidenceError::ParseError(format!("failed to open {}: {}", path.display(), e))
        })?;

        let sheet_name = match sheet {
            Some(name) => name.to_string(),
            None => workbook.sheet_names().first().cloned().ok_or_else(|| {
                IncomeEvidenceError::ParseError(format!("{} contains no sheets", path.display()))
            })?,
        };

        let range = workbook.worksheet_range(&sheet_name).map_err(|e| {
            IncomeEvidenceError::ParseError(format!("failed to read sheet '{}': {}", sheet_name, e))
        })?;

        let mut grid = range.rows().map(|row| row.iter().map(excel_cell_text).collect::<Vec<_>>());
        let headers = grid
            .next()
            .map(|row| row.into_iter().map(|h| h.trim().to_string()).collect())
            .unwrap_or_default();

        Ok(Self::new(headers, grid.collect()))
    }

    /// Dispatches on the file extension: `.csv` is read with the CSV reader,
    /// anything else is treated as a workbook.
    pub fn from_path(path: &Path, sheet: Option<&str>) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "csv" => Self::from_csv_path(path),
            #[cfg(feature = "excel")]
            "xlsx" | "xls" | "xlsm" | "xlsb" | "ods" => Self::from_excel_path(path, sheet),
            other => {
                let _ = sheet;
                Err(IncomeEvidenceError::ParseError(format!(
                    "unsupported spreadsheet format: '{}'",
                    other
                )))
            }
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

/// Lists the worksheets of a workbook.
#[cfg(feature = "excel")]
pub fn sheet_names(path: &Path) -> Result<Vec<String>> {
    use calamine::{open_workbook_auto, Reader};

    let workbook = open_workbook_auto(path).map_err(|e| {
        IncomeEvidenceError::ParseError(format!("failed to open {}: {}", path.display(), e))
    })?;
    Ok(workbook.sheet_names().to_vec())
}

#[cfg(feature = "excel")]
fn excel_cell_text(cell: &calamine::Data) -> String {
    use calamine::Data;

    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Float(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{}", *n as i64)
            } else {
                format!("{}", n)
            }
        }
        Data::Int(n) => n.to_string(),
        Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
    }
}

/// Candidates plus the rows that could not become candidates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSheet {
    pub candidates: Vec<CandidateRecord>,
    pub errors: Vec<ImportRowError>,
}

/// Converts a table into candidate rows. Row numbers in errors and candidates
/// are spreadsheet line numbers (header = line 1).
pub fn parse_table(table: &Table, mapping: &ColumnMapping, max_rows: usize) -> Result<ParsedSheet> {
    if table.rows.is_empty() {
        return Err(IncomeEvidenceError::ParseError("the sheet has no data rows".to_string()));
    }

    if table.rows.len() > max_rows {
        return Err(IncomeEvidenceError::ParseError(format!(
            "the sheet has {} rows, more than the limit of {}",
            table.rows.len(),
            max_rows
        )));
    }

    let required = [
        &mapping.contract_id,
        &mapping.client_name,
        &mapping.annual_confirmed_income,
    ];
    let missing: Vec<&String> = required
        .iter()
        .copied()
        .filter(|name| table.column_index(name).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(IncomeEvidenceError::ParseError(format!(
            "missing required columns {:?}; available columns: {:?}",
            missing, table.headers
        )));
    }

    let contract_col = table.column_index(&mapping.contract_id);
    let client_col = table.column_index(&mapping.client_name);
    let income_col = table.column_index(&mapping.annual_confirmed_income);
    let subject_col = optional_column(table, mapping.subject_entity.as_deref());
    let attachment_col = optional_column(table, mapping.attachment_confirmed_income.as_deref());

    let mut parsed = ParsedSheet::default();

    for (idx, row) in table.rows.iter().enumerate() {
        let line = idx + 2;
        if row.iter().all(|c| c.trim().is_empty()) {
            continue;
        }

        let contract_id = cell_text(row, contract_col);
        let client_name = cell_text(row, client_col);
        let income_text = cell_text(row, income_col);

        let reject = |reason: String| ImportRowError { row: line, reason };

        if contract_id.is_empty() {
            parsed.errors.push(reject("contract id is empty".to_string()));
            continue;
        }
        if client_name.is_empty() {
            parsed.errors.push(reject("client name is empty".to_string()));
            continue;
        }
        if income_text.is_empty() {
            parsed.errors.push(reject("annual confirmed income is empty".to_string()));
            continue;
        }

        let income = match parse_amount(income_text) {
            Some(value) => value,
            None => {
                parsed.errors.push(reject(format!(
                    "annual confirmed income '{}' is not a number",
                    income_text
                )));
                continue;
            }
        };

        let attachment_text = cell_text(row, attachment_col);
        let attachment_income = if attachment_text.is_empty() {
            None
        } else {
            match parse_amount(attachment_text) {
                Some(value) => Some(value),
                None => {
                    parsed.errors.push(reject(format!(
                        "attachment confirmed income '{}' is not a number",
                        attachment_text
                    )));
                    continue;
                }
            }
        };

        parsed.candidates.push(CandidateRecord {
            row: Some(line),
            contract_id: contract_id.to_string(),
            client_name: client_name.to_string(),
            annual_confirmed_income: Some(income),
            subject_entity: cell_text(row, subject_col).to_string(),
            attachment_confirmed_income: attachment_income,
        });
    }

    if !parsed.errors.is_empty() {
        warn!(
            "{} rows could not be parsed; first: {}",
            parsed.errors.len(),
            parsed.errors[0]
        );
    }
    info!("Parsed {} candidate rows", parsed.candidates.len());

    Ok(parsed)
}

fn cell_text(row: &[String], col: Option<usize>) -> &str {
    col.and_then(|c| row.get(c))
        .map(|s| s.trim())
        .filter(|s| !s.eq_ignore_ascii_case("nan"))
        .unwrap_or("")
}

fn optional_column(table: &Table, name: Option<&str>) -> Option<usize> {
    let name = name?;
    let idx = table.column_index(name);
    if idx.is_none() {
        debug!("Optional column '{}' not present in sheet", name);
    }
    idx
}

/// Parses a currency cell. Accepts thousands separators, common currency
/// marks, accounting-style parentheses and scientific notation.
pub fn parse_amount(text: &str) -> Option<Decimal> {
    let mut cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, ',' | '¥' | '￥' | '$' | '元' | ' ' | '\u{a0}'))
        .collect();

    let negative = cleaned.starts_with('(') && cleaned.ends_with(')');
    if negative {
        cleaned = cleaned[1..cleaned.len() - 1].to_string();
    }

    let value = Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .ok()?;

    Some(if negative { -value } else { value })
}

#[derive(Serialize)]
struct ExportRow<'a> {
    #[serde(rename = "合同号")]
    contract_id: &'a str,
    #[serde(rename = "客户名")]
    client_name: &'a str,
    #[serde(rename = "收入主体")]
    subject_entity: &'a str,
    #[serde(rename = "本年确认的收入")]
    annual_confirmed_income: String,
    #[serde(rename = "附件确认的收入")]
    attachment_confirmed_income: Option<String>,
    #[serde(rename = "差异")]
    difference: Option<String>,
    #[serde(rename = "差异备注")]
    difference_note: &'a str,
    #[serde(rename = "附件数量")]
    attachment_count: usize,
    #[serde(rename = "导入时间")]
    import_time: String,
    #[serde(rename = "变化标识")]
    change_status: String,
    #[serde(rename = "版本")]
    version: u32,
}

impl<'a> From<&'a IncomeRecord> for ExportRow<'a> {
    fn from(record: &'a IncomeRecord) -> Self {
        Self {
            contract_id: &record.contract_id,
            client_name: &record.client_name,
            subject_entity: &record.subject_entity,
            annual_confirmed_income: record.annual_confirmed_income.to_string(),
            attachment_confirmed_income: record.attachment_confirmed_income.map(|d| d.to_string()),
            difference: record.difference().map(|d| d.to_string()),
            difference_note: &record.difference_note,
            attachment_count: record.attachment_count(),
            import_time: record
                .import_time
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            change_status: record.change_status(),
            version: record.version,
        }
    }
}

pub fn write_csv<W: Write>(records: &[IncomeRecord], writer: W) -> Result<()> {
    if records.is_empty() {
        return Err(IncomeEvidenceError::ExportError("there are no records to export".to_string()));
    }

    let mut wrt = WriterBuilder::new().from_writer(writer);
    for record in records {
        wrt.serialize(ExportRow::from(record))?;
    }
    wrt.flush()?;
    Ok(())
}

pub fn export_csv(records: &[IncomeRecord], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    write_csv(records, file)?;
    info!("Exported {} records to {}", records.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Cursor;

    const SHEET: &str = "合同号,客户名,本年确认的收入,收入主体\n\
                         HT-001,Acme,\"1,200.50\",Beijing\n\
                         ,Nobody,300,\n\
                         HT-003,Globex,abc,\n\
                         HT-004,Initech,¥800,\n";

    #[test]
    fn test_parse_table_with_default_mapping() {
        let table = Table::from_csv_reader(Cursor::new(SHEET)).unwrap();
        let parsed = parse_table(&table, &ColumnMapping::default(), DEFAULT_MAX_ROWS).unwrap();

        assert_eq!(parsed.candidates.len(), 2);
        assert_eq!(parsed.candidates[0].annual_confirmed_income, Some(dec!(1200.50)));
        assert_eq!(parsed.candidates[0].subject_entity, "Beijing");
        assert_eq!(parsed.candidates[0].row, Some(2));
        assert_eq!(parsed.candidates[1].annual_confirmed_income, Some(dec!(800)));

        let rows: Vec<usize> = parsed.errors.iter().map(|e| e.row).collect();
        assert_eq!(rows, vec![3, 4]);
        assert!(parsed.errors[1].reason.contains("not a number"));
    }

    #[test]
    fn test_missing_required_column_fails_whole_sheet() {
        let table = Table::from_csv_reader(Cursor::new("合同号,客户名\nHT-1,Acme\n")).unwrap();
        let err = parse_table(&table, &ColumnMapping::default(), DEFAULT_MAX_ROWS).unwrap_err();
        assert!(matches!(err, IncomeEvidenceError::ParseError(_)));
    }

    #[test]
    fn test_row_limit() {
        let table = Table::from_csv_reader(Cursor::new(SHEET)).unwrap();
        assert!(parse_table(&table, &ColumnMapping::default(), 2).is_err());
    }

    #[test]
    fn test_detect_mapping_from_headers() {
        let headers: Vec<String> = ["Contract No", "Client Name", "附件收入", "Revenue 2024", "Legal Entity"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mapping = ColumnMapping::detect(&headers).unwrap();
        assert_eq!(mapping.contract_id, "Contract No");
        assert_eq!(mapping.client_name, "Client Name");
        assert_eq!(mapping.annual_confirmed_income, "Revenue 2024");
        assert_eq!(mapping.attachment_confirmed_income.as_deref(), Some("附件收入"));
        assert_eq!(mapping.subject_entity.as_deref(), Some("Legal Entity"));

        let err = ColumnMapping::detect(&["Contract".to_string()]).unwrap_err();
        assert!(err.to_string().contains("client_name"));
    }

    #[test]
    fn test_parse_amount_variants() {
        assert_eq!(parse_amount("1,234.56"), Some(dec!(1234.56)));
        assert_eq!(parse_amount("￥ 99"), Some(dec!(99)));
        assert_eq!(parse_amount("(50.25)"), Some(dec!(-50.25)));
        assert_eq!(parse_amount("1e3"), Some(dec!(1000)));
        assert_eq!(parse_amount("twelve"), None);
    }

    #[test]
    fn test_blank_rows_are_skipped_but_keep_line_numbers() {
        let sheet = "合同号,客户名,本年确认的收入\nHT-1,Acme,10\n,,\nHT-2,Globex,20\n";
        let table = Table::from_csv_reader(Cursor::new(sheet)).unwrap();
        let parsed = parse_table(&table, &ColumnMapping::default(), DEFAULT_MAX_ROWS).unwrap();

        assert!(parsed.errors.is_empty());
        assert_eq!(parsed.candidates[1].row, Some(4));
    }

    #[test]
    fn test_export_uses_named_headers() {
        let mut record = IncomeRecord::new("HT-001", "Acme", dec!(1000))
            .unwrap()
            .with_attachment_confirmed_income(dec!(400))
            .unwrap();
        record.is_new = true;

        let mut out = Vec::new();
        write_csv(&[record], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();

        assert_eq!(
            lines.next().unwrap(),
            "合同号,客户名,收入主体,本年确认的收入,附件确认的收入,差异,差异备注,附件数量,导入时间,变化标识,版本"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("HT-001,Acme,,1000,400,600,,0,"));
        assert!(row.ends_with(",new,1"));
    }

    #[test]
    fn test_export_rejects_empty_input() {
        let err = write_csv(&[], Vec::new()).unwrap_err();
        assert!(matches!(err, IncomeEvidenceError::ExportError(_)));
    }
}
