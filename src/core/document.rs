//! Document representation.
//!
//! A document is an opaque tenant artifact: an uploaded manual, a regulation,
//! guidance material (AMC/GM), or evidence. Documents own their chunks;
//! deletion cascades in the storage layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Semantic class of a document, matching the vector collection split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceClass {
    /// A tenant-supplied procedural manual (the audit subject).
    Manual,
    /// Regulation text.
    Regulation,
    /// Acceptable Means of Compliance material.
    Amc,
    /// Guidance Material.
    Gm,
    /// Evidence and case material.
    Evidence,
}

impl SourceClass {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Regulation => "regulation",
            Self::Amc => "amc",
            Self::Gm => "gm",
            Self::Evidence => "evidence",
        }
    }

    /// Parses the database representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "regulation" => Some(Self::Regulation),
            "amc" => Some(Self::Amc),
            "gm" => Some(Self::Gm),
            "evidence" => Some(Self::Evidence),
            _ => None,
        }
    }
}

/// Document lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    /// Stored but not yet chunked and embedded.
    Uploaded,
    /// Chunking and embedding confirmed.
    Processed,
    /// Processing failed.
    Failed,
}

impl DocumentStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    /// Parses the database representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "uploaded" => Some(Self::Uploaded),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// An uploaded document record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Surrogate id (assigned by the storage layer).
    pub id: Option<i64>,
    /// Opaque stable identifier, unique across the corpus.
    pub external_id: String,
    /// Original upload filename.
    pub original_filename: String,
    /// Path of the stored file under the data root.
    pub storage_path: String,
    /// Size of the stored file in bytes.
    pub size_bytes: i64,
    /// SHA-256 of the stored content.
    pub sha256: String,
    /// Semantic class.
    pub source_class: SourceClass,
    /// Owning organization, if any.
    pub organization: Option<String>,
    /// Lifecycle status.
    pub status: DocumentStatus,
}

impl Document {
    /// Creates a new document record with a fresh external id and
    /// `uploaded` status.
    #[must_use]
    pub fn new(
        original_filename: impl Into<String>,
        storage_path: impl Into<String>,
        size_bytes: i64,
        sha256: impl Into<String>,
        source_class: SourceClass,
    ) -> Self {
        Self {
            id: None,
            external_id: Uuid::new_v4().simple().to_string(),
            original_filename: original_filename.into(),
            storage_path: storage_path.into(),
            size_bytes,
            sha256: sha256.into(),
            source_class,
            organization: None,
            status: DocumentStatus::Uploaded,
        }
    }

    /// Sets the owning organization.
    #[must_use]
    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }
}
