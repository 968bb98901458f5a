use crate::error::{Result, TransferError};
use crate::transfer::constants::MAX_FILENAME_LENGTH;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Percentage of `done` over `total`, clamped to 0..=100 (an empty total is 100)
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

/// Validate file info against size and name-length limits
pub fn validate_transfer_info(file_name: &str, file_size: u64, max_file_size: u64) -> Result<()> {
    if file_size > max_file_size {
        return Err(TransferError::protocol(format!(
            "file rejected: {} ({} bytes) exceeds maximum allowed size of {} bytes",
            file_name, file_size, max_file_size
        )));
    }
    if file_name.len() > MAX_FILENAME_LENGTH {
        return Err(TransferError::protocol(format!(
            "file rejected: name too long ({} bytes, max {})",
            file_name.len(),
            MAX_FILENAME_LENGTH
        )));
    }
    Ok(())
}

/// Format transfer speed from bytes and elapsed time
pub fn format_transfer_speed(bytes_transferred: u64, elapsed_secs: f64) -> String {
    if elapsed_secs <= 0.0 {
        return "Starting...".to_string();
    }

    let speed_bps = bytes_transferred as f64 / elapsed_secs;
    if speed_bps > 1_000_000.0 {
        format!("{:.2} MB/s", speed_bps / 1_000_000.0)
    } else if speed_bps > 1_000.0 {
        format!("{:.1} KB/s", speed_bps / 1_000.0)
    } else {
        format!("{:.0} B/s", speed_bps)
    }
}

/// Best-effort media type from the file extension
pub fn guess_media_type(file_name: &str) -> Option<String> {
    let ext = Path::new(file_name).extension()?.to_str()?.to_ascii_lowercase();
    let media_type = match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => return None,
    };
    Some(media_type.to_string())
}

/// Sanitize file name to prevent path traversal attacks and ensure safety
pub fn sanitize_file_name(file_name: &str) -> String {
    // Last component of either separator style
    let file_name = file_name.rsplit(['/', '\\']).next().unwrap_or_default();

    let clean_name: String = file_name.chars().filter(|c| !c.is_control()).collect();

    // Windows reserved device names
    let reserved_names = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if reserved_names
        .iter()
        .any(|r| clean_name.eq_ignore_ascii_case(r))
    {
        return "unknown_file".to_string();
    }

    if clean_name == ".." || clean_name == "." || clean_name.trim().is_empty() {
        return "unknown_file".to_string();
    }

    truncate_preserving_extension(clean_name)
}

fn truncate_preserving_extension(mut name: String) -> String {
    if name.len() <= MAX_FILENAME_LENGTH {
        return name;
    }

    let ext = match name.rfind('.') {
        Some(idx) if name.len() - idx < 20 => name[idx..].to_string(),
        _ => String::new(),
    };
    let mut cutoff = MAX_FILENAME_LENGTH - ext.len();
    while !name.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    name.truncate(cutoff);
    name.push_str(&ext);
    name
}

/// Create a new file readable only by its owner (0o600 on Unix)
pub async fn open_secure_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

/// Write a received file into `dir` without overwriting anything.
///
/// The name is sanitized; on collision ` (n)` is inserted before the
/// extension.
pub async fn write_received_file(dir: &Path, file_name: &str, data: &[u8]) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let clean = sanitize_file_name(file_name);
    let (stem, ext) = match clean.rfind('.') {
        Some(idx) if idx > 0 => (&clean[..idx], &clean[idx..]),
        _ => (clean.as_str(), ""),
    };

    for attempt in 0u32.. {
        let candidate = if attempt == 0 {
            dir.join(&clean)
        } else {
            dir.join(format!("{stem} ({attempt}){ext}"))
        };
        match open_secure_file(&candidate).await {
            Ok(mut file) => {
                file.write_all(data).await?;
                file.flush().await?;
                return Ok(candidate);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::other("no free file name"))
}
