//! Shared prepare/record/finalize scaffolding used by every download
//! variant. Each variant is responsible only for the actual byte
//! streaming (`stream_to`); everything else — short-circuiting an
//! already-downloaded product, record-file bookkeeping, and archive
//! extraction — lives here so the strategies can't diverge on it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::error::{EodagError, Result};
use crate::model::Product;

/// Invoked with `(bytes_since_last_call, total_bytes)`; `total_bytes` is
/// `None` when the server didn't send a `Content-Length`.
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

#[derive(Clone)]
pub struct DownloadOptions {
    pub outputs_prefix: PathBuf,
    pub extract: bool,
    pub delete_archive: bool,
    pub archive_depth: u32,
    pub progress: Option<ProgressFn>,
    pub chunk_size: usize,
    /// Checked between chunks of a streamed download; a cancelled token
    /// aborts the transfer with a `Download` error instead of letting it
    /// run to completion.
    pub cancellation: Option<CancellationToken>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        DownloadOptions {
            outputs_prefix: PathBuf::from("."),
            extract: true,
            delete_archive: true,
            archive_depth: 2,
            progress: None,
            chunk_size: 64 * 1024,
            cancellation: None,
        }
    }
}

/// Outcome of `prepare`: either the product is already present and the
/// caller should return immediately, or streaming must proceed to
/// `destination`.
pub enum PrepareOutcome {
    AlreadyDownloaded(PathBuf),
    NeedsDownload { destination: PathBuf, record_file: PathBuf },
}

/// Sanitizes a product title for filesystem use: strips accents (NFD
/// decompose, drop combining marks), keeps alphanumerics, dash,
/// underscore and dot, and collapses any run of other characters into a
/// single `_`.
pub fn sanitize(name: &str) -> String {
    let without_accents: String = name.nfd().filter(|c| !is_combining_mark(*c)).collect();
    let mut result = String::with_capacity(without_accents.len());
    let mut last_was_replaced = false;
    for c in without_accents.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
            result.push(c);
            last_was_replaced = false;
        } else if !last_was_replaced {
            result.push('_');
            last_was_replaced = true;
        }
    }
    result
}

fn record_file_name(remote_location: &str) -> String {
    format!("{:x}", md5::compute(remote_location.as_bytes()))
}

/// Step 1-6 of the base download algorithm.
pub fn prepare(product: &Product, options: &DownloadOptions, outputs_extension: &str) -> Result<PrepareOutcome> {
    if let Some(local_path) = product.location.strip_prefix("file://") {
        if Path::new(local_path).exists() {
            return Ok(PrepareOutcome::AlreadyDownloaded(PathBuf::from(local_path)));
        }
    }

    let sanitized_title = sanitize(&product.title);
    let base_name = if sanitized_title.is_empty() { sanitize(&product.id) } else { sanitized_title };
    let destination = options.outputs_prefix.join(format!("{base_name}{outputs_extension}"));

    let record_dir = options.outputs_prefix.join(".downloaded");
    std::fs::create_dir_all(&record_dir)
        .map_err(|e| EodagError::download(&product.id, format!("could not create record directory: {e}")))?;
    let record_file = record_dir.join(record_file_name(&product.remote_location));

    let destination_exists = destination.exists();
    if record_file.exists() && destination_exists {
        return Ok(PrepareOutcome::AlreadyDownloaded(destination));
    }
    if record_file.exists() && !destination_exists {
        std::fs::remove_file(&record_file)
            .map_err(|e| EodagError::download(&product.id, format!("could not clear stale record file: {e}")))?;
    }

    Ok(PrepareOutcome::NeedsDownload { destination, record_file })
}

/// Streams `body` (an async byte stream) to `destination` in
/// `chunk_size`-bounded writes, invoking `progress` after each chunk.
/// Writes land in a sibling `.part` file first and are renamed into
/// place only after a clean flush, so a reader racing a concurrent
/// download never observes a partial file at `destination`.
pub async fn stream_body_to_file(
    mut body: impl futures::Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Unpin,
    destination: &Path,
    total: Option<u64>,
    progress: Option<&ProgressFn>,
    cancellation: Option<&CancellationToken>,
) -> Result<()> {
    use futures::StreamExt;

    let temp_path = temp_path_for(destination);
    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|e| EodagError::download(destination.display().to_string(), format!("could not create temp file: {e}")))?;

    while let Some(chunk) = body.next().await {
        if cancellation.is_some_and(|t| t.is_cancelled()) {
            drop(file);
            let _ = std::fs::remove_file(&temp_path);
            return Err(EodagError::download(destination.display().to_string(), "download cancelled"));
        }
        let chunk = chunk.map_err(|e| EodagError::download(destination.display().to_string(), e.to_string()))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| EodagError::download(destination.display().to_string(), format!("write failed: {e}")))?;
        if let Some(progress) = progress {
            progress(chunk.len() as u64, total);
        }
    }
    file.flush().await.map_err(|e| EodagError::download(destination.display().to_string(), format!("flush failed: {e}")))?;
    drop(file);
    tokio::fs::rename(&temp_path, destination)
        .await
        .map_err(|e| EodagError::download(destination.display().to_string(), format!("could not move temp file into place: {e}")))?;
    Ok(())
}

fn temp_path_for(destination: &Path) -> PathBuf {
    let file_name = destination.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    destination.with_file_name(format!("{file_name}.part"))
}

/// Writes the record file marking a download as durably complete.
pub fn write_record(record_file: &Path, remote_location: &str) -> Result<()> {
    std::fs::write(record_file, remote_location)
        .map_err(|e| EodagError::download(remote_location, format!("could not write record file: {e}")))
}

/// Extracts `archive_path` if it is a `.zip` or `.tar.gz`, walks
/// single-subdirectory chains up to `archive_depth` levels to find the
/// real product root, optionally deletes the archive, and returns the
/// final path (the archive path unchanged if it wasn't an archive).
pub fn finalize(archive_path: &Path, options: &DownloadOptions) -> Result<PathBuf> {
    if !options.extract {
        return Ok(archive_path.to_path_buf());
    }

    let extracted_dir = archive_path.with_extension("");
    let is_zip = archive_path.extension().and_then(|e| e.to_str()) == Some("zip");
    let is_targz = archive_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(".tar.gz"))
        .unwrap_or(false);

    if !is_zip && !is_targz {
        return Ok(archive_path.to_path_buf());
    }

    let extraction = if is_zip { extract_zip(archive_path, &extracted_dir) } else { extract_targz(archive_path, &extracted_dir) };
    if let Err(err) = extraction {
        tracing::warn!(path = %archive_path.display(), error = %err, "archive is corrupt, keeping it as-is under a bare name");
        let _ = std::fs::remove_dir_all(&extracted_dir);
        std::fs::rename(archive_path, &extracted_dir)
            .map_err(|e| EodagError::download(archive_path.display().to_string(), format!("could not rename corrupt archive: {e}")))?;
        return Ok(extracted_dir);
    }

    if options.delete_archive {
        let _ = std::fs::remove_file(archive_path);
    }

    Ok(descend_single_subdirectory_chains(&extracted_dir, options.archive_depth))
}

fn extract_zip(archive_path: &Path, destination: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)
        .map_err(|e| EodagError::download(archive_path.display().to_string(), format!("could not open archive: {e}")))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| EodagError::download(archive_path.display().to_string(), format!("corrupt zip archive: {e}")))?;
    archive
        .extract(destination)
        .map_err(|e| EodagError::download(archive_path.display().to_string(), format!("zip extraction failed: {e}")))
}

fn extract_targz(archive_path: &Path, destination: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)
        .map_err(|e| EodagError::download(archive_path.display().to_string(), format!("could not open archive: {e}")))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(destination)
        .map_err(|e| EodagError::download(archive_path.display().to_string(), format!("corrupt tar.gz archive: {e}")))
}

/// Many providers wrap the real product directory in one or more
/// single-entry directories (`outer/inner/actual-files`); descend
/// through them up to `max_depth` times.
fn descend_single_subdirectory_chains(start: &Path, max_depth: u32) -> PathBuf {
    let mut current = start.to_path_buf();
    for _ in 0..max_depth {
        let Ok(mut entries) = std::fs::read_dir(&current) else { break };
        let Some(Ok(only_entry)) = entries.next() else { break };
        if entries.next().is_some() {
            break;
        }
        if !only_entry.path().is_dir() {
            break;
        }
        current = only_entry.path();
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize("S2A/MSI L1C:2024"), "S2A_MSI_L1C_2024");
    }

    #[test]
    fn sanitize_strips_accents() {
        assert_eq!(sanitize("âtre fête île"), "atre_fete_ile");
    }

    #[test]
    fn sanitize_collapses_consecutive_unsafe_characters() {
        assert_eq!(sanitize("name with multiple  spaces"), "name_with_multiple_spaces");
    }

    #[test]
    fn prepare_short_circuits_when_local_file_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let local_file = dir.path().join("existing.zip");
        std::fs::write(&local_file, b"data").unwrap();
        let mut product = Product::new("A", "S2_MSI_L1C", "1", "https://a/1");
        product.location = format!("file://{}", local_file.display());
        let outcome = prepare(&product, &DownloadOptions::default(), ".zip").unwrap();
        assert!(matches!(outcome, PrepareOutcome::AlreadyDownloaded(_)));
    }

    #[test]
    fn prepare_clears_stale_record_when_destination_missing() {
        let dir = tempfile::tempdir().unwrap();
        let options = DownloadOptions { outputs_prefix: dir.path().to_path_buf(), ..DownloadOptions::default() };
        let product = Product::new("A", "S2_MSI_L1C", "1", "https://a/1");
        let record_dir = dir.path().join(".downloaded");
        std::fs::create_dir_all(&record_dir).unwrap();
        std::fs::write(record_dir.join(record_file_name(&product.remote_location)), "https://a/1").unwrap();

        let outcome = prepare(&product, &options, ".zip").unwrap();
        assert!(matches!(outcome, PrepareOutcome::NeedsDownload { .. }));
        assert!(!record_dir.join(record_file_name(&product.remote_location)).exists());
    }

    #[tokio::test]
    async fn stream_body_to_file_stops_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("out.bin");
        let token = CancellationToken::new();
        token.cancel();
        let body = futures::stream::iter(vec![Ok::<bytes::Bytes, reqwest::Error>(bytes::Bytes::from_static(b"data"))]);
        let result = stream_body_to_file(body, &destination, None, None, Some(&token)).await;
        assert!(result.is_err());
        assert!(!destination.exists());
    }

    #[test]
    fn finalize_renames_corrupt_zip_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("product.zip");
        std::fs::write(&archive, b"not a real zip file").unwrap();
        let options = DownloadOptions { outputs_prefix: dir.path().to_path_buf(), ..DownloadOptions::default() };
        let result = finalize(&archive, &options).unwrap();
        assert_eq!(result, dir.path().join("product"));
        assert!(result.exists());
        assert!(!archive.exists());
    }

    #[test]
    fn finalize_leaves_corrupt_archive_untouched_when_extract_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("product.zip");
        std::fs::write(&archive, b"not a real zip file").unwrap();
        let options = DownloadOptions { outputs_prefix: dir.path().to_path_buf(), extract: false, ..DownloadOptions::default() };
        let result = finalize(&archive, &options).unwrap();
        assert_eq!(result, archive);
    }

    #[test]
    fn descend_single_subdirectory_chains_stops_at_multi_entry_directory() {
        let dir = tempfile::tempdir().unwrap();
        let outer = dir.path().join("outer");
        let inner = outer.join("inner");
        std::fs::create_dir_all(&inner).unwrap();
        std::fs::write(inner.join("a.txt"), "x").unwrap();
        std::fs::write(inner.join("b.txt"), "y").unwrap();
        let resolved = descend_single_subdirectory_chains(&outer, 5);
        assert_eq!(resolved, inner);
    }
}
