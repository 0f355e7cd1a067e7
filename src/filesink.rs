//! File sink (C4): path-safe staged file assembly for multi-part
//! downloads and module artifacts, with zlib decompression for Python
//! agents.
//!
//! The "skywalker guard" (I5): every write must canonicalize to a path
//! under `<install>/downloads/`. Symlinks and `..` segments are resolved
//! before the prefix check, so neither can walk the write outside the
//! download root.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{AgentError, Result};
use crate::events::{AgentEvent, EventSink};
use crate::packet::Language;

/// Resolve `<downloads_root>/<agent_name>/<remote_path>` and reject any
/// path whose canonicalization escapes `downloads_root`.
///
/// `remote_path` arrives in whatever separator convention the agent's
/// host OS uses (backslash on Windows); both separators are accepted and
/// normalized to the platform's own before joining.
fn resolve_safe_path(downloads_root: &Path, agent_name: &str, remote_path: &str) -> Result<PathBuf> {
    let agent_dir = downloads_root.join(agent_name);
    fs::create_dir_all(&agent_dir).map_err(|_| AgentError::PathEscape)?;

    let normalized = remote_path.replace('\\', "/");
    let candidate = agent_dir.join(normalized.trim_start_matches('/'));

    if let Some(parent) = candidate.parent() {
        fs::create_dir_all(parent).map_err(|_| AgentError::PathEscape)?;
    }

    let canonical_root = fs::canonicalize(downloads_root).map_err(|_| AgentError::PathEscape)?;
    // The file may not exist yet; canonicalize its parent and re-append
    // the file name so a non-existent leaf doesn't fail canonicalization.
    let parent = candidate.parent().ok_or(AgentError::PathEscape)?;
    let canonical_parent = fs::canonicalize(parent).map_err(|_| AgentError::PathEscape)?;
    let file_name = candidate.file_name().ok_or(AgentError::PathEscape)?;

    if !canonical_parent.starts_with(&canonical_root) {
        return Err(AgentError::PathEscape);
    }

    Ok(canonical_parent.join(file_name))
}

/// `(header_crc32, data, trailer_crc32)`, zlib-compressed `data`. Decode,
/// verify both CRCs (warn-only on mismatch per the recovered-locally
/// error policy), and return the decompressed bytes.
fn unwrap_zlib_frame(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() < 8 {
        warn!("zlib_wrapper frame shorter than the 8-byte CRC envelope");
        return bytes.to_vec();
    }
    let header_crc = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let trailer_crc = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
    let compressed = &bytes[4..bytes.len() - 4];

    let mut decoder = flate2::read::ZlibDecoder::new(compressed);
    let mut decompressed = Vec::new();
    if decoder.read_to_end(&mut decompressed).is_err() {
        warn!("failed to inflate zlib_wrapper payload");
        return compressed.to_vec();
    }

    let actual_crc = crc32fast::hash(&decompressed);
    if header_crc != trailer_crc || actual_crc != header_crc {
        warn!(
            header_crc,
            trailer_crc, actual_crc, "zlib_wrapper CRC mismatch; keeping decompressed data anyway"
        );
    }
    decompressed
}

/// `save_download(session_id, remote_path, bytes, total_size, append)`.
///
/// Returns the on-disk path written and the progress percentage
/// (`min(100, round(on_disk/total × 100, 2))`).
#[allow(clippy::too_many_arguments)]
pub fn save_download(
    downloads_root: &Path,
    session_id: &str,
    remote_path: &str,
    bytes: &[u8],
    total_size: u64,
    append: bool,
    language: Language,
    events: &dyn EventSink,
) -> Result<(PathBuf, f64)> {
    let path = match resolve_safe_path(downloads_root, session_id, remote_path) {
        Ok(p) => p,
        Err(e) => {
            warn!(session_id, remote_path, "path escape attempt blocked");
            events.publish(AgentEvent::checkin(
                session_id,
                format!("blocked path-escape download to {remote_path}"),
            ));
            return Err(e);
        }
    };

    let payload = if language == Language::Python {
        unwrap_zlib_frame(bytes)
    } else {
        bytes.to_vec()
    };

    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(&path)
        .map_err(|_| AgentError::PathEscape)?;
    file.write_all(&payload).map_err(|_| AgentError::PathEscape)?;

    let on_disk = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    let pct = if total_size == 0 {
        100.0
    } else {
        let raw = (on_disk as f64 / total_size as f64) * 100.0;
        (raw * 100.0).round() / 100.0
    }
    .min(100.0);

    events.publish(AgentEvent::checkin(
        session_id,
        format!("download progress for {remote_path}: {pct}%"),
    ));

    Ok((path, pct))
}

/// Write a complete, already-assembled file under `<downloads_root>/<session_id>/<relative_name>`,
/// applying the same skywalker guard as [`save_download`]. Used for the
/// job-save opcodes, which hand over one fully-decoded blob rather than a
/// stream of append chunks.
pub fn save_named_file(
    downloads_root: &Path,
    session_id: &str,
    relative_name: &str,
    bytes: &[u8],
) -> Result<PathBuf> {
    let path = resolve_safe_path(downloads_root, session_id, relative_name)?;
    let mut file = fs::File::create(&path).map_err(|_| AgentError::PathEscape)?;
    file.write_all(bytes).map_err(|_| AgentError::PathEscape)?;
    Ok(path)
}

/// Append keystroke log data with control-sequence normalization
/// (collapsing raw backspace/arrow sequences the way a keylogger task's
/// raw terminal capture needs before it's human-readable).
pub fn append_keystrokes(downloads_root: &Path, session_id: &str, text: &str) -> Result<()> {
    let path = resolve_safe_path(downloads_root, session_id, "keystrokes.txt")?;
    let normalized = normalize_control_sequences(text);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|_| AgentError::PathEscape)?;
    file.write_all(normalized.as_bytes())
        .map_err(|_| AgentError::PathEscape)?;
    Ok(())
}

fn normalize_control_sequences(text: &str) -> String {
    text.chars().filter(|c| !c.is_control() || *c == '\n' || *c == '\t').collect()
}

/// Append one timestamped entry to `<downloads_root>/<agent_name>/agent.log`,
/// the per-agent console transcript written alongside (almost) every
/// dispatched result.
pub fn append_agent_log(downloads_root: &Path, session_id: &str, text: &str) -> Result<()> {
    let path = resolve_safe_path(downloads_root, session_id, "agent.log")?;
    let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
    let entry = format!("\n{timestamp} : \n{text}\n");
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|_| AgentError::PathEscape)?;
    file.write_all(entry.as_bytes()).map_err(|_| AgentError::PathEscape)?;
    Ok(())
}
