//! Input resolution: turn a user-supplied path into a validated byte buffer.
//!
//! The pipeline itself only ever sees a complete in-memory PDF. Reading the
//! file here lets us report missing files, permission problems and non-PDF
//! input as distinct errors before lopdf gets a chance to produce a less
//! helpful parse failure.

use crate::error::ExtractError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The four bytes every PDF file starts with.
pub const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// A fully read PDF file.
#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

/// Read `path` and validate its PDF magic bytes.
pub async fn resolve_input(path: impl AsRef<Path>) -> Result<ResolvedInput, ExtractError> {
    let path = path.as_ref().to_path_buf();

    let bytes = match tokio::fs::read(&path).await {
        Ok(b) => b,
        Err(e) => return Err(io_error(path, e)),
    };

    check_magic(&path, &bytes)?;

    debug!("Resolved local PDF: {} ({} bytes)", path.display(), bytes.len());
    Ok(ResolvedInput { path, bytes })
}

/// Blocking twin of [`resolve_input`] for the sync entry points.
pub fn resolve_input_blocking(path: impl AsRef<Path>) -> Result<ResolvedInput, ExtractError> {
    let path = path.as_ref().to_path_buf();
    let bytes = std::fs::read(&path).map_err(|e| io_error(path.clone(), e))?;
    check_magic(&path, &bytes)?;
    Ok(ResolvedInput { path, bytes })
}

/// `true` when the buffer starts with `%PDF`.
pub fn has_pdf_magic(bytes: &[u8]) -> bool {
    bytes.len() >= PDF_MAGIC.len() && &bytes[..PDF_MAGIC.len()] == PDF_MAGIC
}

fn check_magic(path: &Path, bytes: &[u8]) -> Result<(), ExtractError> {
    if has_pdf_magic(bytes) {
        return Ok(());
    }
    let mut magic = [0u8; 4];
    let n = bytes.len().min(4);
    magic[..n].copy_from_slice(&bytes[..n]);
    Err(ExtractError::NotAPdf {
        path: path.to_path_buf(),
        magic,
    })
}

fn io_error(path: PathBuf, e: std::io::Error) -> ExtractError {
    match e.kind() {
        ErrorKind::PermissionDenied => ExtractError::PermissionDenied { path },
        _ => ExtractError::FileNotFound { path },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn magic_detection() {
        assert!(has_pdf_magic(b"%PDF-1.7\n..."));
        assert!(!has_pdf_magic(b"%PD"));
        assert!(!has_pdf_magic(b"GIF89a"));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let err = resolve_input("/definitely/not/here.pdf").await.unwrap_err();
        assert!(matches!(err, ExtractError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn non_pdf_reports_magic() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"GIF89a").unwrap();
        let err = resolve_input(f.path()).await.unwrap_err();
        match err {
            ExtractError::NotAPdf { magic, .. } => assert_eq!(&magic, b"GIF8"),
            other => panic!("expected NotAPdf, got {other:?}"),
        }
    }

    #[test]
    fn short_file_is_not_a_pdf() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"%P").unwrap();
        let err = resolve_input_blocking(f.path()).unwrap_err();
        assert!(matches!(err, ExtractError::NotAPdf { .. }));
    }

    #[test]
    fn pdf_is_read_whole() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"%PDF-1.5\nrest").unwrap();
        let input = resolve_input_blocking(f.path()).unwrap();
        assert_eq!(input.bytes.len(), 13);
    }
}
