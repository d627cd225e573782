use crate::error::{IncomeEvidenceError, Result};
use crate::spreadsheet::DEFAULT_MAX_ROWS;
use log::{info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ImportSettings {
    #[schemars(description = "Largest number of data rows read from one sheet")]
    pub max_rows: usize,

    #[schemars(description = "Logical columns a sheet must provide before any row is read")]
    pub required_columns: Vec<String>,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            required_columns: vec![
                "contract_id".to_string(),
                "client_name".to_string(),
                "annual_confirmed_income".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BackupSettings {
    #[schemars(description = "Write a backup of the data file before every import")]
    pub auto_backup: bool,

    #[schemars(description = "Number of backups kept in the backup directory")]
    pub max_backup_files: usize,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            auto_backup: true,
            max_backup_files: 10,
        }
    }
}

/// Application settings, stored as JSON next to the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Settings {
    #[schemars(description = "JSON snapshot holding records, attachments and version history")]
    pub data_file: PathBuf,

    #[schemars(description = "Directory under which attachment files are stored, one folder per contract")]
    pub attachment_root: PathBuf,

    #[schemars(description = "Directory receiving data file backups")]
    pub backup_dir: PathBuf,

    pub import: ImportSettings,
    pub backup: BackupSettings,

    #[schemars(description = "Spreadsheet most recently imported")]
    pub last_import_path: Option<PathBuf>,

    #[schemars(description = "File most recently exported")]
    pub last_export_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::rooted_at(Path::new("data"))
    }
}

impl Settings {
    /// Default layout with every path placed under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            data_file: root.join("income_records.json"),
            attachment_root: root.join("attachments"),
            backup_dir: root.join("backups"),
            import: ImportSettings::default(),
            backup: BackupSettings::default(),
            last_import_path: None,
            last_export_path: None,
        }
    }

    /// Reads settings from `path`, falling back to defaults when the file is
    /// missing. Keys absent from the file take their default values.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content).map_err(|e| {
            IncomeEvidenceError::PersistenceError(format!(
                "invalid settings file {}: {}",
                path.display(),
                e
            ))
        })?;

        if settings.import.max_rows == 0 {
            warn!("import.max_rows is 0; every sheet will import empty");
        }
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(Settings)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&Self::generate_json_schema())
    }
}
