//! File operations on a handle's filesystem.
//!
//! The directory sandbox works on host paths directly. Container backends go
//! through the runtime's exec so files are created by the user's account.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use tokio::fs;

use crate::container::{ContainerError, ContainerRuntimeApi, ExecOptions};
use crate::error::Result;

/// Bytes written per exec call when copying into a container.
const WRITE_CHUNK_SIZE: usize = 4096;

/// `find -printf` format: type, size, mtime, name.
const LIST_FORMAT: &str = "%y\\t%s\\t%T@\\t%f\\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

pub(crate) async fn host_kind(path: &Path) -> Result<Option<FileKind>> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(Some(FileKind::Dir)),
        Ok(_) => Ok(Some(FileKind::File)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn host_list(path: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    let mut dir = fs::read_dir(path).await?;
    while let Some(entry) = dir.next_entry().await? {
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(e) => {
                debug!("Skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };
        entries.push(FileEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            kind: if meta.is_dir() {
                FileKind::Dir
            } else {
                FileKind::File
            },
            size: meta.len(),
            modified: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

pub(crate) async fn host_read(path: &Path) -> Result<Vec<u8>> {
    Ok(fs::read(path).await?)
}

pub(crate) async fn host_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, data).await?;
    Ok(())
}

pub(crate) async fn host_remove(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        fs::remove_dir_all(path).await?;
    } else {
        fs::remove_file(path).await?;
    }
    Ok(())
}

pub(crate) async fn host_create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).await?;
    Ok(())
}

/// File operations executed inside a container.
pub(crate) struct ContainerFiles<'a> {
    runtime: &'a dyn ContainerRuntimeApi,
    container: &'a str,
    options: ExecOptions,
}

impl<'a> ContainerFiles<'a> {
    pub(crate) fn new(
        runtime: &'a dyn ContainerRuntimeApi,
        container: &'a str,
        user: Option<&str>,
    ) -> Self {
        Self {
            runtime,
            container,
            options: ExecOptions {
                user: user.map(str::to_string),
                workdir: None,
                env: Vec::new(),
            },
        }
    }

    async fn run(&self, command: Vec<String>) -> Result<String> {
        Ok(self
            .runtime
            .exec_output(self.container, &self.options, &command)
            .await?)
    }

    pub(crate) async fn kind(&self, path: &Path) -> Result<Option<FileKind>> {
        let script = r#"if [ -d "$1" ]; then echo dir; elif [ -e "$1" ]; then echo file; fi"#;
        let out = self.run(sh(script, vec![path_arg(path)])).await?;
        Ok(match out.trim() {
            "dir" => Some(FileKind::Dir),
            "file" => Some(FileKind::File),
            _ => None,
        })
    }

    pub(crate) async fn list(&self, path: &Path) -> Result<Vec<FileEntry>> {
        let mut command = argv(&["find"], path);
        command.extend(
            ["-mindepth", "1", "-maxdepth", "1", "-printf", LIST_FORMAT].map(str::to_string),
        );
        let out = self.run(command).await?;
        let mut entries: Vec<FileEntry> = out.lines().filter_map(parse_listing_line).collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub(crate) async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let out = self.run(argv(&["od", "-An", "-v", "-tx1", "--"], path)).await?;
        let digits: String = out.split_whitespace().collect();
        hex::decode(digits).map_err(|e| ContainerError::failed("od", e.to_string()).into())
    }

    pub(crate) async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let target = path_arg(path);
        let truncate = r#"mkdir -p -- "$(dirname -- "$1")" && : > "$1""#;
        self.run(sh(truncate, vec![target.clone()])).await?;
        for chunk in data.chunks(WRITE_CHUNK_SIZE) {
            let append = r#"printf "$1" >> "$2""#;
            self.run(sh(append, vec![octal_escape(chunk), target.clone()]))
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn remove(&self, path: &Path) -> Result<()> {
        self.run(argv(&["rm", "-rf", "--"], path)).await?;
        Ok(())
    }

    pub(crate) async fn create_dir(&self, path: &Path) -> Result<()> {
        self.run(argv(&["mkdir", "-p", "--"], path)).await?;
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// `program args.. path`
fn argv(program: &[&str], path: &Path) -> Vec<String> {
    let mut command: Vec<String> = program.iter().map(|s| s.to_string()).collect();
    command.push(path_arg(path));
    command
}

/// `sh -c script sh args..`, so arguments reach the script as `$1`, `$2`.
fn sh(script: &str, args: Vec<String>) -> Vec<String> {
    let mut command = vec![
        "sh".to_string(),
        "-c".to_string(),
        script.to_string(),
        "sh".to_string(),
    ];
    command.extend(args);
    command
}

/// Every byte as a `printf` octal escape.
fn octal_escape(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{b:03o}")).collect()
}

fn parse_listing_line(line: &str) -> Option<FileEntry> {
    let mut fields = line.splitn(4, '\t');
    let kind = match fields.next()? {
        "d" => FileKind::Dir,
        _ => FileKind::File,
    };
    let size = fields.next()?.parse().ok()?;
    let (secs, nanos) = parse_epoch(fields.next()?)?;
    let name = fields.next()?.to_string();
    Some(FileEntry {
        name,
        kind,
        size,
        modified: DateTime::from_timestamp(secs, nanos)?,
    })
}

/// `1700000000.123456789` as seconds and nanoseconds.
fn parse_epoch(text: &str) -> Option<(i64, u32)> {
    let (secs, frac) = text.split_once('.').unwrap_or((text, ""));
    let frac: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
    Some((secs.parse().ok()?, frac.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listing_line() {
        let entry = parse_listing_line("d\t4096\t1700000000.5000000000\tsrc").unwrap();
        assert_eq!(entry.name, "src");
        assert_eq!(entry.kind, FileKind::Dir);
        assert_eq!(entry.size, 4096);
        assert_eq!(entry.modified.timestamp(), 1_700_000_000);
        assert_eq!(entry.modified.timestamp_subsec_millis(), 500);

        let entry = parse_listing_line("f\t3\t1700000000\tname\twith tab").unwrap();
        assert_eq!(entry.kind, FileKind::File);
        assert_eq!(entry.name, "name\twith tab");

        assert!(parse_listing_line("garbage").is_none());
    }

    #[test]
    fn test_octal_escape() {
        assert_eq!(octal_escape(b"A\n\0"), "\\101\\012\\000");
        assert_eq!(octal_escape(&[0xff]), "\\377");
    }

    #[tokio::test]
    async fn test_host_operations() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a/b/note.txt");

        host_write(&file, b"hello").await.unwrap();
        assert_eq!(host_kind(&file).await.unwrap(), Some(FileKind::File));
        assert_eq!(host_kind(&dir.path().join("a")).await.unwrap(), Some(FileKind::Dir));
        assert_eq!(host_read(&file).await.unwrap(), b"hello");

        let listing = host_list(&dir.path().join("a/b")).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "note.txt");
        assert_eq!(listing[0].size, 5);

        host_remove(&dir.path().join("a")).await.unwrap();
        assert_eq!(host_kind(&file).await.unwrap(), None);
    }
}
