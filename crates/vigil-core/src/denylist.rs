//! CSV-backed denylist store.
//!
//! The store file has a `name,filename` header; `filename` is resolved
//! relative to the reference-image directory. The same format backs the
//! optional known-persons list.

use crate::face::FaceEncoder;
use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DenylistError {
    #[error("denylist file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("denylist file {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("reference image {0} does not exist")]
    MissingImage(PathBuf),
    #[error("invalid entry name: {0:?}")]
    InvalidName(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Row {
    name: String,
    filename: String,
}

/// A name and the reference image it was enrolled with.
#[derive(Debug, Clone, PartialEq)]
pub struct DenylistRecord {
    pub name: String,
    pub image_path: PathBuf,
}

/// A name with the embedding derived from its reference image.
#[derive(Debug, Clone)]
pub struct DenylistEntry {
    pub name: String,
    pub embedding: Embedding,
}

/// An entry that could not be encoded.
#[derive(Debug, Clone)]
pub struct SkippedEntry {
    pub name: String,
    pub reason: String,
}

/// Outcome of [`DenylistStore::encode`].
#[derive(Debug, Default)]
pub struct EncodeReport {
    pub entries: Vec<DenylistEntry>,
    pub skipped: Vec<SkippedEntry>,
}

pub struct DenylistStore {
    csv_path: PathBuf,
    image_dir: PathBuf,
}

impl DenylistStore {
    pub fn new(csv_path: impl Into<PathBuf>, image_dir: impl Into<PathBuf>) -> Self {
        Self {
            csv_path: csv_path.into(),
            image_dir: image_dir.into(),
        }
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    /// Read every row, in file order.
    ///
    /// A name that appears twice keeps the position of its first row and the
    /// image of its last.
    pub fn load(&self) -> Result<Vec<DenylistRecord>, DenylistError> {
        let mut reader = csv::Reader::from_path(&self.csv_path).map_err(|e| self.csv_error(e))?;

        let mut records: Vec<DenylistRecord> = Vec::new();
        for row in reader.deserialize::<Row>() {
            let row = row.map_err(|e| self.csv_error(e))?;
            let image_path = self.image_dir.join(&row.filename);
            match records.iter_mut().find(|r| r.name == row.name) {
                Some(existing) => {
                    tracing::warn!(name = %row.name, "duplicate denylist name; later row replaces image");
                    existing.image_path = image_path;
                }
                None => records.push(DenylistRecord {
                    name: row.name,
                    image_path,
                }),
            }
        }

        tracing::info!(path = %self.csv_path.display(), count = records.len(), "denylist loaded");
        Ok(records)
    }

    /// Derive one embedding per record from its reference image.
    ///
    /// Failures are isolated per entry: an unreadable image, an encoder error
    /// or an image without a face skips that entry and is logged.
    pub fn encode(records: &[DenylistRecord], encoder: &mut dyn FaceEncoder) -> EncodeReport {
        let mut report = EncodeReport::default();

        for record in records {
            let outcome = image::open(&record.image_path)
                .map_err(|e| format!("failed to read {}: {e}", record.image_path.display()))
                .and_then(|img| encoder.encode(&img.to_rgb8()).map_err(|e| e.to_string()));

            match outcome {
                Ok(faces) => match faces.into_iter().next() {
                    Some(face) => report.entries.push(DenylistEntry {
                        name: record.name.clone(),
                        embedding: face.embedding,
                    }),
                    None => {
                        tracing::warn!(name = %record.name, path = %record.image_path.display(), "no face in reference image; entry skipped");
                        report.skipped.push(SkippedEntry {
                            name: record.name.clone(),
                            reason: "no face detected".into(),
                        });
                    }
                },
                Err(reason) => {
                    tracing::warn!(name = %record.name, %reason, "failed to encode reference image; entry skipped");
                    report.skipped.push(SkippedEntry {
                        name: record.name.clone(),
                        reason,
                    });
                }
            }
        }

        report
    }

    /// Copy `source_image` into the image directory and append a row.
    ///
    /// Existing rows with the same name are left in place.
    pub fn add(&self, name: &str, source_image: &Path) -> Result<DenylistRecord, DenylistError> {
        let name = name.trim();
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(DenylistError::InvalidName(name.to_string()));
        }
        if !source_image.is_file() {
            return Err(DenylistError::MissingImage(source_image.to_path_buf()));
        }

        let extension = source_image
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("jpg");
        let filename = format!("{}.{extension}", name.replace(' ', "_"));

        std::fs::create_dir_all(&self.image_dir).map_err(|e| self.io_error(&self.image_dir, e))?;
        let image_path = self.image_dir.join(&filename);
        std::fs::copy(source_image, &image_path).map_err(|e| self.io_error(&image_path, e))?;

        if let Some(parent) = self.csv_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(parent, e))?;
        }
        let is_new = std::fs::metadata(&self.csv_path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.csv_path)
            .map_err(|e| self.io_error(&self.csv_path, e))?;

        let mut writer = csv::WriterBuilder::new().has_headers(is_new).from_writer(file);
        writer
            .serialize(Row {
                name: name.to_string(),
                filename,
            })
            .map_err(|e| self.csv_error(e))?;
        writer.flush().map_err(|e| self.io_error(&self.csv_path, e))?;

        tracing::info!(name, path = %image_path.display(), "added denylist entry");
        Ok(DenylistRecord {
            name: name.to_string(),
            image_path,
        })
    }

    fn csv_error(&self, source: csv::Error) -> DenylistError {
        DenylistError::Csv {
            path: self.csv_path.clone(),
            source,
        }
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> DenylistError {
        DenylistError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
