use crate::error::{IncomeEvidenceError, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif"];
const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "txt", "rtf"];
const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "rar", "7z", "tar", "gz"];
const EMAIL_EXTENSIONS: &[&str] = &["eml", "msg"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Image,
    Document,
    Archive,
    Email,
    Other,
}

impl FileType {
    pub fn from_extension(extension: &str) -> Self {
        let ext = extension.trim_start_matches('.').to_lowercase();
        let ext = ext.as_str();
        if IMAGE_EXTENSIONS.contains(&ext) {
            Self::Image
        } else if DOCUMENT_EXTENSIONS.contains(&ext) {
            Self::Document
        } else if ARCHIVE_EXTENSIONS.contains(&ext) {
            Self::Archive
        } else if EMAIL_EXTENSIONS.contains(&ext) {
            Self::Email
        } else {
            Self::Other
        }
    }
}

/// Catalogue entry for a supporting document stored for a contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub contract_id: String,
    pub source_path: String,
    pub stored_path: String,
    pub original_name: String,
    pub file_size: u64,
    pub file_extension: String,
    pub created_time: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
}

impl Attachment {
    /// Builds a catalogue entry, reading size from the stored copy when it exists.
    pub fn new(
        contract_id: impl Into<String>,
        source_path: impl Into<String>,
        stored_path: impl Into<String>,
    ) -> Self {
        let source_path = source_path.into();
        let stored_path = stored_path.into();

        let source = Path::new(&source_path);
        let original_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_extension = source
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let file_size = fs::metadata(&stored_path).map(|m| m.len()).unwrap_or(0);

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            contract_id: contract_id.into(),
            source_path,
            stored_path,
            original_name,
            file_size,
            file_extension,
            created_time: Utc::now(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_extension(&self.file_extension)
    }

    pub fn exists(&self) -> bool {
        Path::new(&self.stored_path).exists()
    }

    pub fn display_name(&self) -> String {
        if self.original_name.is_empty() {
            format!("attachment_{}", &self.id[..8.min(self.id.len())])
        } else {
            self.original_name.clone()
        }
    }
}

/// File storage for attachments, keyed by contract id. Paths handed back are
/// opaque strings to the record layer.
pub trait AttachmentStorage {
    /// Copies `source` into the contract's storage and returns the stored path.
    fn save(&self, source: &Path, contract_id: &str, custom_name: Option<&str>) -> Result<String>;

    /// Returns `false` when there was nothing to delete.
    fn delete(&self, stored_path: &str) -> Result<bool>;

    fn list_for_contract(&self, contract_id: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub contract_count: usize,
    pub file_count: usize,
    pub total_size: u64,
}

/// Stores every contract's files in `<root>/<encoded contract id>/`.
#[derive(Debug, Clone)]
pub struct FsAttachmentStorage {
    root: PathBuf,
}

impl FsAttachmentStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!("Attachment storage at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn contract_folder(&self, contract_id: &str) -> PathBuf {
        self.root.join(encode_contract_id(contract_id))
    }

    /// True when `path` resolves to a file inside the storage root.
    fn owns(&self, path: &Path) -> Result<bool> {
        let root = self.root.canonicalize()?;
        let file = path.canonicalize()?;
        Ok(file != root && file.starts_with(&root))
    }

    /// Moves a stored file into another contract's folder.
    pub fn move_to_contract(&self, stored_path: &str, new_contract_id: &str) -> Result<String> {
        let old_path = Path::new(stored_path);
        if !old_path.is_file() {
            return Err(IncomeEvidenceError::AttachmentError(format!(
                "attachment '{}' does not exist",
                stored_path
            )));
        }
        if !self.owns(old_path)? {
            return Err(IncomeEvidenceError::AttachmentError(format!(
                "attachment '{}' is outside {}",
                stored_path,
                self.root.display()
            )));
        }

        let file_name = old_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let folder = self.contract_folder(new_contract_id);
        fs::create_dir_all(&folder)?;
        let target = unique_target(&folder, &file_name);

        fs::rename(old_path, &target)?;
        remove_if_empty(old_path.parent().filter(|parent| *parent != self.root.as_path()));

        info!("Moved attachment {} -> {}", stored_path, target.display());
        Ok(target.to_string_lossy().into_owned())
    }

    /// Total bytes stored for one contract; 0 when it has no folder.
    pub fn folder_size(&self, contract_id: &str) -> Result<u64> {
        let folder = self.contract_folder(contract_id);
        if !folder.is_dir() {
            return Ok(0);
        }

        let mut total = 0;
        for entry in fs::read_dir(&folder)? {
            let meta = entry?.metadata()?;
            if meta.is_file() {
                total += meta.len();
            }
        }
        Ok(total)
    }

    pub fn storage_info(&self) -> Result<StorageInfo> {
        let mut info = StorageInfo::default();
        for entry in fs::read_dir(&self.root)? {
            let folder = entry?.path();
            if !folder.is_dir() {
                continue;
            }
            info.contract_count += 1;
            for file in fs::read_dir(&folder)? {
                let meta = file?.metadata()?;
                if meta.is_file() {
                    info.file_count += 1;
                    info.total_size += meta.len();
                }
            }
        }
        Ok(info)
    }
}

impl AttachmentStorage for FsAttachmentStorage {
    fn save(&self, source: &Path, contract_id: &str, custom_name: Option<&str>) -> Result<String> {
        if !source.is_file() {
            return Err(IncomeEvidenceError::AttachmentError(format!(
                "source file '{}' does not exist",
                source.display()
            )));
        }

        let folder = self.contract_folder(contract_id);
        fs::create_dir_all(&folder)?;

        let extension = source
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let file_name = match custom_name {
            Some(name) => {
                let name = sanitize_filename(name);
                if name.to_lowercase().ends_with(&extension.to_lowercase()) {
                    name
                } else {
                    format!("{}{}", name, extension)
                }
            }
            None => source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| sanitize_filename("")),
        };

        let target = unique_target(&folder, &file_name);
        fs::copy(source, &target)?;

        info!("Saved attachment for {}: {}", contract_id, target.display());
        Ok(target.to_string_lossy().into_owned())
    }

    fn delete(&self, stored_path: &str) -> Result<bool> {
        let path = Path::new(stored_path);
        if !path.exists() {
            warn!("Attachment to delete does not exist: {}", stored_path);
            return Ok(false);
        }
        if !self.owns(path)? {
            warn!(
                "Refusing to delete {}: not under attachment root {}",
                stored_path,
                self.root.display()
            );
            return Ok(false);
        }

        fs::remove_file(path)?;
        remove_if_empty(path.parent().filter(|parent| *parent != self.root.as_path()));
        info!("Deleted attachment {}", stored_path);
        Ok(true)
    }

    fn list_for_contract(&self, contract_id: &str) -> Result<Vec<String>> {
        let folder = self.contract_folder(contract_id);
        if !folder.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&folder)? {
            let path = entry?.path();
            if path.is_file() {
                files.push(path.to_string_lossy().into_owned());
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Folder name for a contract id. Characters that are illegal in file names,
/// `%` itself, control characters and leading or trailing dots and spaces are
/// percent-encoded, so distinct ids never share a folder.
pub fn encode_contract_id(contract_id: &str) -> String {
    if contract_id.is_empty() {
        return "%".to_string();
    }

    let chars: Vec<char> = contract_id.chars().collect();
    let last = chars.len() - 1;
    let mut encoded = String::with_capacity(contract_id.len());

    for (idx, &c) in chars.iter().enumerate() {
        let at_edge = idx == 0 || idx == last;
        let escape = c == '%'
            || c.is_control()
            || INVALID_FILENAME_CHARS.contains(&c)
            || (at_edge && (c == '.' || c == ' '));

        if escape {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        } else {
            encoded.push(c);
        }
    }
    encoded
}

/// Replaces characters that are illegal in file names and trims leading and
/// trailing dots and spaces. Never returns an empty string.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if INVALID_FILENAME_CHARS.contains(&c) { '_' } else { c })
        .collect();
    let trimmed = replaced.trim_matches(|c| c == '.' || c == ' ');

    if trimmed.is_empty() {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("file_{}", &id[..8])
    } else {
        trimmed.to_string()
    }
}

fn unique_target(folder: &Path, file_name: &str) -> PathBuf {
    let candidate = folder.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let name_path = Path::new(file_name);
    let stem = name_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = name_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1;
    loop {
        let candidate = folder.join(format!("{}_{}{}", stem, counter, suffix));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

fn remove_if_empty(folder: Option<&Path>) {
    if let Some(folder) = folder {
        let is_empty = fs::read_dir(folder)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty && fs::remove_dir(folder).is_ok() {
            info!("Removed empty folder {}", folder.display());
        }
    }
}
