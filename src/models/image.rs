use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Key every image document is matched on during merges. Never overwritten.
pub const FILE_KEY: &str = "file";

/// Presence of this key means the pipeline has measured the image.
pub const BASE_SIZE_KEY: &str = "base_size";

/// Wedge flag carried into the pipeline input listing.
pub const WEDGE_KEY: &str = "wedge";

/// One biopsy image submitted with a job, with its clinical covariates.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewImageEntry {
    /// Uploaded file name, extension included.
    #[garde(length(min = 1, max = 255))]
    pub file_id: String,

    #[garde(range(min = 0.0, max = 1.0))]
    pub kdpi: f64,

    /// `LymDep`, `LND` or anything else for no induction.
    #[garde(length(max = 32))]
    pub induction: String,

    /// Recipient age in years.
    #[garde(range(min = 0.0, max = 120.0))]
    pub age: f64,

    /// `Y` when the kidney was pumped.
    #[garde(length(min = 1, max = 8))]
    pub pump: String,

    /// Cold ischemia time in hours.
    #[garde(range(min = 0.0, max = 200.0))]
    pub cit: f64,

    #[serde(default)]
    #[garde(skip)]
    pub wedge: Option<String>,
}

impl NewImageEntry {
    /// File name without extension, and the extension.
    pub fn split_file_id(&self) -> (&str, &str) {
        match self.file_id.rsplit_once('.') {
            Some((name, format)) => (name, format),
            None => (self.file_id.as_str(), ""),
        }
    }

    /// Initial image document, before any pipeline measurement.
    pub fn initial_doc(&self, donor: Uuid, recipient: Uuid) -> Map<String, Value> {
        let (file, format) = self.split_file_id();
        let mut doc = Map::new();
        doc.insert(FILE_KEY.into(), Value::from(file));
        doc.insert("format".into(), Value::from(format));
        doc.insert("kdpi".into(), Value::from(self.kdpi));
        doc.insert(WEDGE_KEY.into(), Value::from(self.wedge.as_deref().unwrap_or_default()));
        doc.insert("donor".into(), Value::from(donor.to_string()));
        doc.insert("recipient".into(), Value::from(recipient.to_string()));
        doc
    }
}

/// A persisted image document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub doc: Map<String, Value>,
}

impl ImageRecord {
    pub fn file(&self) -> Option<&str> {
        self.doc.get(FILE_KEY).and_then(Value::as_str)
    }

    pub fn wedge(&self) -> &str {
        self.doc.get(WEDGE_KEY).and_then(Value::as_str).unwrap_or_default()
    }

    /// True until the pipeline output has been merged into this image.
    pub fn is_pending(&self) -> bool {
        self.doc.get(BASE_SIZE_KEY).map_or(true, Value::is_null)
    }

    pub fn donor_id(&self) -> Option<Uuid> {
        self.doc.get("donor").and_then(Value::as_str).and_then(|s| s.parse().ok())
    }

    pub fn recipient_id(&self) -> Option<Uuid> {
        self.doc.get("recipient").and_then(Value::as_str).and_then(|s| s.parse().ok())
    }
}
