//! Multipart file upload into the shell's current directory.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::access::{client_ip, UserLevel};
use super::server::ServerState;

#[derive(Debug, Serialize)]
pub struct SavedFile {
    pub original: String,
    pub name: String,
    pub bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub directory: String,
    pub files: Vec<SavedFile>,
}

pub async fn handle_upload(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut multipart: Multipart,
) -> Response {
    let ip = client_ip(&addr);
    if state.user_level_for(&ip) != UserLevel::Interact {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    let target_dir = match state.session.current_dir() {
        Ok(dir) => dir,
        Err(_) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "Shell directory not available")
                .into_response()
        }
    };
    if !target_dir.is_dir() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Shell directory not available").into_response();
    }

    info!(ip = %ip, dir = %target_dir.display(), "upload: receiving files");

    let mut saved: Vec<SavedFile> = Vec::new();
    let mut total_bytes: u64 = 0;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "upload: malformed multipart body");
                return (StatusCode::BAD_REQUEST, "Upload failed").into_response();
            }
        };

        let Some(original) = field.file_name().map(str::to_string) else {
            continue;
        };
        if original.is_empty() {
            continue;
        }

        let mut safe_name = sanitize_filename(&original);
        if safe_name.is_empty() {
            safe_name = "upload.bin".to_string();
        }

        let (final_name, file) = match create_unique_file(&target_dir, &safe_name) {
            Ok(created) => created,
            Err(err) => {
                warn!(error = %err, "upload: failed to create file");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create upload file")
                    .into_response();
            }
        };

        let mut file = tokio::fs::File::from_std(file);
        let mut bytes: u64 = 0;
        let mut field = field;
        let write_result: Result<(), Response> = loop {
            match field.chunk().await {
                Ok(Some(chunk)) => {
                    if file.write_all(&chunk).await.is_err() {
                        break Err(
                            (StatusCode::INTERNAL_SERVER_ERROR, "Upload failed").into_response()
                        );
                    }
                    bytes += chunk.len() as u64;
                }
                Ok(None) => break Ok(()),
                Err(err) => {
                    warn!(error = %err, "upload: read error mid-part");
                    break Err((StatusCode::INTERNAL_SERVER_ERROR, "Upload failed").into_response());
                }
            }
        };
        if let Err(response) = write_result {
            drop(file);
            let _ = tokio::fs::remove_file(target_dir.join(&final_name)).await;
            return response;
        }
        if file.flush().await.is_err() {
            let _ = tokio::fs::remove_file(target_dir.join(&final_name)).await;
            return (StatusCode::INTERNAL_SERVER_ERROR, "Upload failed").into_response();
        }

        info!(name = %final_name, bytes, "upload: saved");
        total_bytes += bytes;
        saved.push(SavedFile {
            original,
            name: final_name,
            bytes,
        });
    }

    if saved.is_empty() {
        return (StatusCode::BAD_REQUEST, "No files received").into_response();
    }

    info!(files = saved.len(), total_bytes, "upload: complete");

    Json(UploadResponse {
        directory: target_dir.to_string_lossy().into_owned(),
        files: saved,
    })
    .into_response()
}

/// Reduce a client-supplied filename to a safe basename: NULs removed,
/// separators normalized, path stripped, reserved characters and control
/// bytes neutralized. Returns an empty string for names with nothing
/// usable left.
pub fn sanitize_filename(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let normalized = trimmed.replace('\0', "").replace('\\', "/");
    let base = normalized.rsplit('/').next().unwrap_or("").trim();
    if base.is_empty() || base == "." || base == ".." {
        return String::new();
    }

    const INVALID: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let cleaned: String = base
        .chars()
        .filter_map(|c| {
            if (c as u32) < 32 {
                None
            } else if INVALID.contains(&c) {
                Some('_')
            } else {
                Some(c)
            }
        })
        .collect();

    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return String::new();
    }
    cleaned.to_string()
}

/// Open `filename` in `dir` exclusively, appending ` (N)` before the
/// extension on collision until a fresh name is found.
pub fn create_unique_file(dir: &Path, filename: &str) -> std::io::Result<(String, std::fs::File)> {
    let (base, ext) = split_name(filename);
    for counter in 0..10_000 {
        let candidate = if counter == 0 {
            filename.to_string()
        } else {
            format!("{base} ({counter}){ext}")
        };
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(&candidate))
        {
            Ok(file) => return Ok((candidate, file)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
    Err(std::io::Error::other("too many name collisions"))
}

fn split_name(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(idx) if idx > 0 => (&filename[..idx], &filename[idx..]),
        _ => (filename, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_basic_names() {
        assert_eq!(sanitize_filename(" hello.txt "), "hello.txt");
        assert_eq!(sanitize_filename("C:\\fakepath\\photo.png"), "photo.png");
        assert_eq!(sanitize_filename("../notes.md"), "notes.md");
    }

    #[test]
    fn sanitize_rejects_dot_names() {
        assert_eq!(sanitize_filename("."), "");
        assert_eq!(sanitize_filename(".."), "");
        assert_eq!(sanitize_filename(""), "");
        assert_eq!(sanitize_filename("   "), "");
    }

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_filename("a<b>.txt"), "a_b_.txt");
        assert_eq!(sanitize_filename("q?u*o\"te.txt"), "q_u_o_te.txt");
    }

    #[test]
    fn sanitize_strips_control_bytes() {
        assert_eq!(sanitize_filename("a\u{1}b.txt"), "ab.txt");
        assert_eq!(sanitize_filename("nul\0byte.bin"), "nulbyte.bin");
    }

    #[test]
    fn split_name_handles_extensions() {
        assert_eq!(split_name("file.txt"), ("file", ".txt"));
        assert_eq!(split_name("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_name("noext"), ("noext", ""));
        assert_eq!(split_name(".bashrc"), (".bashrc", ""));
    }

    #[test]
    fn unique_file_appends_counter() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("file.txt"), b"existing").expect("fixture");

        let (first, file) = create_unique_file(dir.path(), "file.txt").expect("first");
        drop(file);
        assert_eq!(first, "file (1).txt");

        let (second, file) = create_unique_file(dir.path(), "file.txt").expect("second");
        drop(file);
        assert_eq!(second, "file (2).txt");

        assert!(dir.path().join("file (1).txt").exists());
        assert!(dir.path().join("file (2).txt").exists());
    }

    #[test]
    fn unique_file_without_collision_keeps_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (name, file) = create_unique_file(dir.path(), "fresh.bin").expect("create");
        drop(file);
        assert_eq!(name, "fresh.bin");
    }
}
