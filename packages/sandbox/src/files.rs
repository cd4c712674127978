// ABOUTME: Cross-boundary file transfer: directory listing, downloads, uploads and file links
// ABOUTME: Downloads go through engine tar archives by id or the host data directory by name

use crate::archive::{read_members, select_member, single_file_archive};
use crate::engine::ExecRequest;
use crate::error::{Result, SandboxError};
use crate::manager::{RunningSandbox, SandboxManager};
use crate::types::FileEntry;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

/// A file read request: exactly one of the identifiers plus a path
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileRequest {
    #[serde(default)]
    pub sandbox_id: String,
    #[serde(default)]
    pub sandbox_name: String,
    pub file_path: String,
}

/// Bytes of one retrieved file plus what a transport needs to serve it
#[derive(Debug, Clone, PartialEq)]
pub struct FileDownload {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub filename: String,
    pub content_disposition: String,
}

impl FileDownload {
    fn new(bytes: Vec<u8>, name: &str) -> Self {
        let filename = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        Self {
            bytes,
            content_type: content_type_for(&filename),
            content_disposition: format!("inline; filename={}", filename),
            filename,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub success: bool,
    pub message: String,
}

impl UploadResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Guess a content type from the file extension
pub fn content_type_for(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase());

    match extension.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "application/javascript; charset=utf-8",
        Some("json") => "application/json; charset=utf-8",
        Some("csv") => "text/csv; charset=utf-8",
        Some("txt") | Some("log") | Some("py") => "text/plain; charset=utf-8",
        Some("md") => "text/markdown; charset=utf-8",
        Some("xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("tar") => "application/x-tar",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

/// List `directory` through an already acquired sandbox; failures yield an empty listing
pub(crate) async fn list_entries(
    sandbox: &RunningSandbox<'_>,
    directory: &str,
    with_change_time: bool,
) -> Vec<FileEntry> {
    let listing = match sandbox
        .exec(ExecRequest::new(["ls", "-1", directory]))
        .await
    {
        Ok(output) if output.success() => output.stdout_lossy(),
        Ok(output) => {
            debug!(
                sandbox_id = %sandbox.sandbox().short_id(),
                "ls {} exited with {}: {}",
                directory,
                output.exit_code,
                output.stderr_lossy().trim()
            );
            return Vec::new();
        }
        Err(e) => {
            error!(sandbox_id = %sandbox.sandbox().short_id(), "Failed to list {}: {}", directory, e);
            return Vec::new();
        }
    };

    let base = directory.trim_end_matches('/');
    let paths = listing
        .lines()
        .filter(|line| !line.is_empty())
        .map(|name| format!("{}/{}", base, name));

    if !with_change_time {
        return paths
            .map(|path| FileEntry {
                path,
                change_time: 0,
            })
            .collect();
    }

    let mut entries = Vec::new();
    for path in paths {
        let output = match sandbox
            .exec(ExecRequest::new(["stat", "-c", "%n|%Z", path.as_str()]))
            .await
        {
            Ok(output) if output.success() => output.stdout_lossy(),
            _ => continue,
        };

        // The change time is the last field; names may contain '|'
        if let Some((name, ctime)) = output.trim().rsplit_once('|') {
            if let Ok(change_time) = ctime.trim().parse::<i64>() {
                entries.push(FileEntry {
                    path: name.to_string(),
                    change_time,
                });
            }
        }
    }
    entries
}

/// Path relative to the sandbox data directory, rejecting escapes
fn host_relative_path(work_dir: &str, file_path: &str) -> Result<PathBuf> {
    let work_dir = work_dir.trim_end_matches('/');
    let relative = file_path
        .strip_prefix(work_dir)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .unwrap_or(file_path)
        .trim_start_matches('/');

    let path = PathBuf::from(relative);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if relative.is_empty() || escapes {
        return Err(SandboxError::Validation(format!(
            "invalid file path: {}",
            file_path
        )));
    }
    Ok(path)
}

/// File transfer across the sandbox boundary
pub struct FileTransfer {
    manager: Arc<SandboxManager>,
    base_url: String,
}

impl FileTransfer {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        let base_url = manager.config().server.public_base_url();
        Self { manager, base_url }
    }

    /// Full paths of the entries in `directory`
    pub async fn list(&self, sandbox_id: &str, directory: &str) -> Vec<String> {
        let Some(sandbox) = self.acquire_quietly(sandbox_id).await else {
            return Vec::new();
        };
        list_entries(&sandbox, directory, false)
            .await
            .into_iter()
            .map(|entry| entry.path)
            .collect()
    }

    /// Entries of `directory` with their change times; entries whose stat fails are skipped
    pub async fn list_with_change_time(&self, sandbox_id: &str, directory: &str) -> Vec<FileEntry> {
        let Some(sandbox) = self.acquire_quietly(sandbox_id).await else {
            return Vec::new();
        };
        list_entries(&sandbox, directory, true).await
    }

    async fn acquire_quietly(&self, sandbox_id: &str) -> Option<RunningSandbox<'_>> {
        match self.manager.acquire_running(sandbox_id).await {
            Ok(sandbox) => Some(sandbox),
            Err(e) => {
                error!(sandbox = %sandbox_id, "Cannot list files: {}", e);
                None
            }
        }
    }

    /// Link that retrieves a file through the engine archive API
    pub fn file_link(&self, sandbox_id: &str, file_path: &str) -> String {
        self.link(&[("sandbox_id", sandbox_id), ("file_path", file_path)])
    }

    /// Link that retrieves a file from the host data directory by sandbox name
    pub fn machine_file_link(&self, sandbox_name: &str, file_path: &str) -> String {
        let file_name = file_path.rsplit('/').next().unwrap_or(file_path);
        self.link(&[("sandbox_name", sandbox_name), ("file_path", file_name)])
    }

    fn link(&self, pairs: &[(&str, &str)]) -> String {
        let endpoint = format!("{}/sandbox/file", self.base_url);
        match Url::parse(&endpoint) {
            Ok(mut url) => {
                url.query_pairs_mut().extend_pairs(pairs);
                url.to_string()
            }
            Err(e) => {
                warn!("Invalid base URL {}: {}", self.base_url, e);
                let query: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                format!("{}?{}", endpoint, query.join("&"))
            }
        }
    }

    /// Resolve a file request carrying a sandbox id or name
    pub async fn read_file(&self, request: &FileRequest) -> Result<FileDownload> {
        let sandbox_id = request.sandbox_id.trim();
        let sandbox_name = request.sandbox_name.trim();
        let file_path = request.file_path.trim();

        if sandbox_id.is_empty() && sandbox_name.is_empty() {
            return Err(SandboxError::Validation(
                "either sandbox_id or sandbox_name is required".to_string(),
            ));
        }
        if file_path.is_empty() {
            return Err(SandboxError::Validation(
                "file_path must not be empty".to_string(),
            ));
        }

        if !sandbox_id.is_empty() {
            self.download_by_id(sandbox_id, file_path).await
        } else {
            self.download_by_name(sandbox_name, file_path).await
        }
    }

    /// Fetch `file_path` from inside the sandbox via a tar archive
    pub async fn download_by_id(&self, sandbox_id: &str, file_path: &str) -> Result<FileDownload> {
        let archive = self.manager.archive(sandbox_id, file_path).await?;

        let members = read_members(&archive).map_err(|e| SandboxError::MalformedArchive {
            path: file_path.to_string(),
            message: e.to_string(),
        })?;

        let member = select_member(&members, file_path)
            .ok_or_else(|| SandboxError::EmptyArchive(file_path.to_string()))?;

        if !member.is_file {
            return Err(SandboxError::MemberNotExtractable {
                path: file_path.to_string(),
                member: member.name.clone(),
            });
        }

        debug!(sandbox = %sandbox_id, member = %member.name, "Extracted file from archive");
        Ok(FileDownload::new(member.data.clone(), &member.name))
    }

    /// Read `file_path` from the host directory bind-mounted into the named sandbox
    pub async fn download_by_name(&self, sandbox_name: &str, file_path: &str) -> Result<FileDownload> {
        let sandbox = self.manager.resolve(sandbox_name).await?;
        let relative = host_relative_path(
            &self.manager.config().docker.container_work_dir,
            file_path,
        )?;
        let host_path = self.manager.data_dir(&sandbox.name).join(&relative);

        let bytes = match tokio::fs::read(&host_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SandboxError::FileNotFound(file_path.to_string()))
            }
            Err(e) => {
                return Err(SandboxError::FileAccess {
                    path: host_path.display().to_string(),
                    message: e.to_string(),
                })
            }
        };

        Ok(FileDownload::new(bytes, &relative.to_string_lossy()))
    }

    /// Copy a local file into `dest_dir` inside the sandbox, keeping only its base name
    pub async fn upload(&self, sandbox_id: &str, local_path: &Path, dest_dir: &str) -> UploadResult {
        let is_file = tokio::fs::metadata(local_path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return UploadResult::failed(format!(
                "Local file does not exist: {}",
                local_path.display()
            ));
        }

        let Some(file_name) = local_path.file_name().map(|n| n.to_string_lossy().into_owned())
        else {
            return UploadResult::failed(format!("Invalid local path: {}", local_path.display()));
        };

        let archive = match tokio::fs::read(local_path)
            .await
            .and_then(|data| single_file_archive(&file_name, &data))
        {
            Ok(archive) => archive,
            Err(e) => {
                error!("Failed to pack {}: {}", local_path.display(), e);
                return UploadResult::failed(e.to_string());
            }
        };

        let sandbox = match self.manager.acquire_running(sandbox_id).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                error!(sandbox = %sandbox_id, "Upload failed: {}", e);
                return UploadResult::failed(e.to_string());
            }
        };

        match sandbox.put_archive(dest_dir, archive).await {
            Ok(()) => {
                info!(sandbox_id = %sandbox.sandbox().short_id(), "Uploaded {} to {}", file_name, dest_dir);
                UploadResult {
                    success: true,
                    message: format!(
                        "Uploaded {} to {} in sandbox {}",
                        file_name, dest_dir, sandbox_id
                    ),
                }
            }
            Err(e) => {
                error!(sandbox_id = %sandbox.sandbox().short_id(), "Failed to upload {}: {}", file_name, e);
                UploadResult::failed(e.to_string())
            }
        }
    }
}
