//! Local file I/O: PDF validation, whole-file text reads, atomic writes.
//!
//! We validate the PDF magic bytes (`%PDF`) before handing the path to
//! pdfium so callers get a meaningful error rather than a pdfium crash.
//! Output files are written to a sibling temp file and renamed into place,
//! so a crash mid-write never leaves a truncated result behind.

use crate::error::DocTransError;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Validate that `path` exists, is readable and starts with `%PDF`.
pub fn validate_pdf(path: &Path) -> Result<PathBuf, DocTransError> {
    let path = path.to_path_buf();

    if !path.exists() {
        return Err(DocTransError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_ok() && &magic != b"%PDF" {
                return Err(DocTransError::NotAPdf { path, magic });
            }
        }
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(DocTransError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(DocTransError::FileNotFound { path });
        }
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(path)
}

/// Read a UTF-8 text file in one go.
pub async fn read_text(path: &Path) -> Result<String, DocTransError> {
    tokio::fs::read_to_string(path).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound => DocTransError::FileNotFound {
            path: path.to_path_buf(),
        },
        ErrorKind::PermissionDenied => DocTransError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => DocTransError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        },
    })
}

/// Write `contents` to `path` via a sibling temp file that is renamed into
/// place, creating parent directories.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), DocTransError> {
    let target = path.to_path_buf();
    let data = contents.to_vec();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&target, &data))
        .await
        .map_err(|e| DocTransError::Internal(format!("Write task panicked: {}", e)))?
}

fn write_atomic_blocking(path: &Path, contents: &[u8]) -> Result<(), DocTransError> {
    let fail = |e: std::io::Error| DocTransError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(fail)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".doctrans-")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(fail)?;
    tmp.write_all(contents).map_err(fail)?;
    tmp.persist(path).map_err(|e| fail(e.error))?;

    debug!("Wrote {} bytes to {}", contents.len(), path.display());
    Ok(())
}

/// File stem used to name derived artefacts, e.g. `book` for `book.pdf`.
pub fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "document".to_string())
}
