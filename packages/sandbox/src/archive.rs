// ABOUTME: Pure helpers over tar byte streams used for cross-boundary file transfer
// ABOUTME: Member parsing, exact/suffix/first member selection and single-file archive building

use std::io::Read;
use std::path::Path;

/// One entry of a parsed tar archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    pub name: String,
    pub data: Vec<u8>,
    /// False for directories, links and other non-regular entries
    pub is_file: bool,
}

/// Parse every member of a tar stream, buffering regular file contents
pub fn read_members(bytes: &[u8]) -> std::io::Result<Vec<ArchiveMember>> {
    let mut archive = tar::Archive::new(bytes);
    let mut members = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let is_file = entry.header().entry_type().is_file();

        let mut data = Vec::new();
        if is_file {
            entry.read_to_end(&mut data)?;
        }

        members.push(ArchiveMember {
            name,
            data,
            is_file,
        });
    }

    Ok(members)
}

/// Pick the member that corresponds to `path`.
///
/// Tie-break order: exact match of the normalized relative path, then the first
/// member whose name ends with the base filename, then the first member.
pub fn select_member<'a>(members: &'a [ArchiveMember], path: &str) -> Option<&'a ArchiveMember> {
    let relative = normalize(path);
    let base = Path::new(&relative)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    members
        .iter()
        .find(|m| normalize(&m.name) == relative)
        .or_else(|| {
            if base.is_empty() {
                None
            } else {
                members.iter().find(|m| m.name.ends_with(&base))
            }
        })
        .or_else(|| members.first())
}

/// Build an archive holding one file named `name` (no parent directories)
pub fn single_file_archive(name: &str, data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();

    builder.append_data(&mut header, name, data)?;
    builder.into_inner()
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/')
        .to_string()
}
