//! Upload artifact handling.
//!
//! Opens the stored upload (raw XML or zip archive) and yields the path of
//! the export document the parser will stream. Archive inflation is
//! CPU-bound, so the whole open runs on a blocking worker via
//! `spawn_blocking` instead of stalling the async runtime.
//!
//! Extracted archives land next to the upload
//! (`<upload_dir>/<batch_id>/…`) and are kept on disk so a batch can be
//! reprocessed later without re-uploading.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::ZipArchive;

/// Declared content kind of an upload, derived from its file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Xml,
    Archive,
}

impl SourceKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "xml" => Some(SourceKind::Xml),
            "zip" => Some(SourceKind::Archive),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SourceKind::Xml => "xml",
            SourceKind::Archive => "zip",
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),
    #[error(
        "the export file appears truncated (missing </HealthData> closing tag); \
         re-export and upload the complete file"
    )]
    Truncated,
    #[error("invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("I/O error opening export: {0}")]
    Io(#[from] io::Error),
}

/// Open the uploaded artifact and return the path of a complete export XML.
pub async fn open_export(path: PathBuf, kind: SourceKind) -> Result<PathBuf, ExtractError> {
    tokio::task::spawn_blocking(move || open_export_blocking(&path, kind))
        .await
        .map_err(|e| ExtractError::Io(io::Error::other(e)))?
}

fn open_export_blocking(path: &Path, kind: SourceKind) -> Result<PathBuf, ExtractError> {
    match kind {
        SourceKind::Xml => {
            validate_export_complete(path)?;
            Ok(path.to_path_buf())
        }
        SourceKind::Archive => {
            let xml_path = extract_archive(path)?;
            validate_export_complete(&xml_path)?;
            Ok(xml_path)
        }
    }
}

/// Unpack the archive next to the upload and locate the export document.
/// `export.xml` is preferred; any other `.xml` entry is accepted.
fn extract_archive(path: &Path) -> Result<PathBuf, ExtractError> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)?;

    // uploads/<batch_id>.zip unpacks into uploads/<batch_id>/
    let dest = path.with_extension("");
    fs::create_dir_all(&dest)?;

    log::info!(
        "extracting archive {} ({} entries) into {}",
        path.display(),
        archive.len(),
        dest.display()
    );

    let mut export_candidate: Option<PathBuf> = None;
    let mut fallback_candidate: Option<PathBuf> = None;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;

        // Prevent zip slip / path traversal.
        let Some(rel) = entry.enclosed_name() else {
            log::warn!("skipping unsafe archive entry path: {}", entry.name());
            continue;
        };

        let out_path = dest.join(&rel);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;

        let name = entry.name().to_ascii_lowercase();
        if name.ends_with("export.xml") && export_candidate.is_none() {
            export_candidate = Some(out_path);
        } else if name.ends_with(".xml") && fallback_candidate.is_none() {
            fallback_candidate = Some(out_path);
        }
    }

    export_candidate
        .or(fallback_candidate)
        .ok_or_else(|| ExtractError::UnsupportedFormat("no XML document found in archive".into()))
}

/// Exports can be cut short when the device runs out of space mid-export.
/// A complete document ends with the `</HealthData>` closing tag, which
/// must appear in the final KiB.
fn validate_export_complete(path: &Path) -> Result<(), ExtractError> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let tail_len = len.min(1024);

    file.seek(SeekFrom::End(-(tail_len as i64)))?;
    let mut tail = Vec::with_capacity(tail_len as usize);
    file.read_to_end(&mut tail)?;

    if String::from_utf8_lossy(&tail).contains("</HealthData>") {
        Ok(())
    } else {
        Err(ExtractError::Truncated)
    }
}
