//! Destination file naming and reservation.

use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use url::Url;

/// Highest numeric suffix tried before giving up on a name.
const MAX_SUFFIX: u32 = 9999;

/// Sanitizes a file name for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems
/// (`/ \ : * ? " < > |`) and control characters with `_`.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized.replace('.', "_")
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Derives the file name for a submission.
///
/// Uses the caller's hint when it is non-empty, else the last URL path
/// segment (percent-decoded), else `download_<unix-seconds>`.
#[must_use]
pub fn derive_file_name(url: &Url, hint: Option<&str>) -> String {
    if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
        return sanitize_filename(hint);
    }

    if let Some(mut segments) = url.path_segments()
        && let Some(last) = segments.next_back()
        && !last.is_empty()
    {
        let decoded = urlencoding::decode(last).map_or_else(
            |e| {
                debug!(segment = %last, error = %e, "URL decoding failed, using raw segment");
                last.to_string()
            },
            std::borrow::Cow::into_owned,
        );
        return sanitize_filename(&decoded);
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("download_{timestamp}")
}

/// Atomically claims a destination path in `dir` by creating an empty file.
///
/// If `file_name` is taken, tries `stem_1.ext`, `stem_2.ext`, ... The
/// returned path did not exist before this call, so two reservations never
/// share a path.
///
/// # Errors
///
/// Returns the IO error from file creation, or `AlreadyExists` when every
/// suffix is taken.
pub async fn reserve_destination(dir: &Path, file_name: &str) -> io::Result<PathBuf> {
    let file_name = sanitize_filename(file_name);
    let (stem, ext) = match file_name.rfind('.') {
        Some(pos) if pos > 0 => (&file_name[..pos], &file_name[pos..]),
        _ => (file_name.as_str(), ""),
    };

    for suffix in 0..=MAX_SUFFIX {
        let candidate = if suffix == 0 {
            dir.join(&file_name)
        } else {
            dir.join(format!("{stem}_{suffix}{ext}"))
        };

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => {
                debug!(path = %candidate.display(), "reserved destination");
                return Ok(candidate);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {file_name} in {}", dir.display()),
    ))
}
