//! Device error-code catalog.
//!
//! Maps the in-band [`ErrorCode`] byte carried by device responses to a
//! name and a human-readable description. The catalog is a value handed to
//! the provider at build time; the built-in table can be replaced or
//! extended from JSON:
//!
//! ```json
//! [
//!   { "code": 1, "name": "NO_RESPONSE", "description": "No tag in range", "recoverable": true }
//! ]
//! ```
//!
//! # Example
//!
//! ```
//! use rtls_provider::ErrorCatalog;
//!
//! let catalog = ErrorCatalog::builtin();
//! assert_eq!(catalog.name(0x03), "CHECKSUM_MISMATCH");
//! assert_eq!(catalog.name(0x77), "UNKNOWN");
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::ErrorCode;
use crate::error::Result;

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCodeEntry {
    pub code: u8,
    /// Short identifier.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Whether the engine retries after this error.
    #[serde(default)]
    pub recoverable: bool,
}

/// Lookup table from device error code to description.
#[derive(Debug, Clone, Default)]
pub struct ErrorCatalog {
    entries: BTreeMap<u8, ErrorCodeEntry>,
}

impl ErrorCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// The codes every anchor firmware reports.
    pub fn builtin() -> Self {
        const BUILTIN: &[(ErrorCode, &str, &str, bool)] = &[
            (ErrorCode::NoError, "NO_ERROR", "Success", false),
            (ErrorCode::NoResponse, "NO_RESPONSE", "No tag answered the search", true),
            (ErrorCode::InventoryTimeout, "INVENTORY_TIMEOUT", "Inventory round timed out", true),
            (ErrorCode::ChecksumMismatch, "CHECKSUM_MISMATCH", "Firmware block checksum mismatch", true),
            (ErrorCode::WriteFlashNotBlank, "WRITE_FLASH_NOT_BLANK", "Flash page was not erased", true),
            (ErrorCode::WriteFlashFailed, "WRITE_FLASH_FAILED", "Flash write failed", true),
            (ErrorCode::WriteInfoOk, "WRITE_INFO_OK", "Firmware image committed", false),
            (
                ErrorCode::ChecksumOkResetRequired,
                "CHECKSUM_OK_RESET_REQUIRED",
                "Device must reset into its bootloader",
                false,
            ),
            (ErrorCode::InBootloader, "IN_BOOTLOADER", "Device is running its bootloader", false),
            (ErrorCode::InvalidParameter, "INVALID_PARAMETER", "Device rejected a parameter", false),
            (ErrorCode::DeviceBusy, "DEVICE_BUSY", "Device is busy", true),
        ];

        let mut catalog = Self::new();
        for (code, name, description, recoverable) in BUILTIN {
            catalog.insert(ErrorCodeEntry {
                code: code.as_u8(),
                name: (*name).to_string(),
                description: (*description).to_string(),
                recoverable: *recoverable,
            });
        }
        catalog
    }

    /// Parse a JSON array of entries.
    ///
    /// # Errors
    ///
    /// Returns `Json` if the document is not an array of entries.
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<ErrorCodeEntry> = serde_json::from_str(json)?;
        let mut catalog = Self::new();
        catalog.extend(entries);
        Ok(catalog)
    }

    /// Load a JSON catalog file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Overlay entries from a JSON array onto this catalog.
    pub fn merge_json(mut self, json: &str) -> Result<Self> {
        let entries: Vec<ErrorCodeEntry> = serde_json::from_str(json)?;
        self.extend(entries);
        Ok(self)
    }

    /// Insert or replace an entry.
    pub fn insert(&mut self, entry: ErrorCodeEntry) {
        self.entries.insert(entry.code, entry);
    }

    pub fn get(&self, code: u8) -> Option<&ErrorCodeEntry> {
        self.entries.get(&code)
    }

    /// Entry name, `"UNKNOWN"` for codes not in the table.
    pub fn name(&self, code: u8) -> &str {
        self.get(code).map_or("UNKNOWN", |e| e.name.as_str())
    }

    /// Human-readable description for logs and failure events.
    pub fn describe(&self, code: ErrorCode) -> String {
        match self.get(code.as_u8()) {
            Some(entry) if !entry.description.is_empty() => {
                format!("{} (0x{:02X}): {}", entry.name, entry.code, entry.description)
            }
            Some(entry) => format!("{} (0x{:02X})", entry.name, entry.code),
            None => format!("unknown device error 0x{:02X}", code.as_u8()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Extend<ErrorCodeEntry> for ErrorCatalog {
    fn extend<I: IntoIterator<Item = ErrorCodeEntry>>(&mut self, iter: I) {
        for entry in iter {
            self.insert(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RtlsError;
    use std::io::Write;

    #[test]
    fn test_builtin_covers_known_codes() {
        let catalog = ErrorCatalog::builtin();
        for raw in 0u8..=0x0A {
            assert!(catalog.get(raw).is_some(), "missing 0x{:02X}", raw);
        }
        assert!(catalog.get(ErrorCode::NoResponse.as_u8()).unwrap().recoverable);
    }

    #[test]
    fn test_describe() {
        let catalog = ErrorCatalog::builtin();
        assert_eq!(
            catalog.describe(ErrorCode::WriteFlashFailed),
            "WRITE_FLASH_FAILED (0x05): Flash write failed"
        );
        assert_eq!(
            catalog.describe(ErrorCode::Other(0xEE)),
            "unknown device error 0xEE"
        );
    }

    #[test]
    fn test_merge_overrides_builtin() {
        let catalog = ErrorCatalog::builtin()
            .merge_json(r#"[{"code": 3, "name": "CRC", "description": "Bad CRC"}, {"code": 32, "name": "TAG_LOCKED"}]"#)
            .unwrap();

        assert_eq!(catalog.name(3), "CRC");
        assert_eq!(catalog.describe(ErrorCode::Other(32)), "TAG_LOCKED (0x20)");
        assert!(!catalog.get(32).unwrap().recoverable);
    }

    #[test]
    fn test_from_json_rejects_object() {
        let err = ErrorCatalog::from_json(r#"{"code": 1}"#).unwrap_err();
        assert!(matches!(err, RtlsError::Json(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"code": 1, "name": "NO_TAG"}}]"#).unwrap();

        let catalog = ErrorCatalog::from_file(file.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.name(1), "NO_TAG");
    }
}
