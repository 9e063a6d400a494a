//! File content I/O through the executor
//!
//! The executor may be a container or a remote shell that shares no
//! filesystem with this process, so content travels base64-encoded over the
//! command channel. Writes land in a temporary sibling first and are renamed
//! into place with `mv -f`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::{arg, DiskEngine};
use crate::error::DiskError;
use crate::infra::executor::{shell_quote, CommandExecutor, CommandRequest};

/// Line width of base64 sent to the guest, matching coreutils' default
const BASE64_LINE_WIDTH: usize = 76;

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    /// Size in bytes; zero for device nodes
    pub size: u64,
    /// Mode string as printed by `ls`, e.g. `-rw-r--r--`
    pub permissions: String,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub link_target: Option<String>,
}

/// Encode content as wrapped base64
fn encode_wrapped(content: &[u8]) -> String {
    let encoded = STANDARD.encode(content);
    let mut wrapped = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE_WIDTH + 1);
    for (i, c) in encoded.chars().enumerate() {
        if i > 0 && i % BASE64_LINE_WIDTH == 0 {
            wrapped.push('\n');
        }
        wrapped.push(c);
    }
    wrapped.push('\n');
    wrapped
}

/// Decode base64 output, ignoring line breaks
fn decode_output(path: &Path, output: &str) -> Result<Vec<u8>, DiskError> {
    let compact: String = output.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(compact).map_err(|e| DiskError::Decode {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

fn parent_dir(path: &Path) -> String {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(arg)
        .unwrap_or_else(|| ".".to_string())
}

/// Split off the first `n` whitespace-separated fields, returning them and
/// the untouched remainder of the line
fn split_fields(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    for _ in 0..n {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields, rest))
}

fn looks_like_mode(field: &str) -> bool {
    field.len() >= 10
        && field
            .chars()
            .next()
            .is_some_and(|c| "-dlcbps".contains(c))
}

/// Parse one `ls -la` line
///
/// Accepts GNU and busybox layouts, ISO (`2024-01-31 12:00`) and classic
/// (`Jan 31 12:00`) timestamps, and `major, minor` device columns.
pub fn parse_listing_line(line: &str) -> Result<Option<FileEntry>, DiskError> {
    let trimmed = line.trim_end();
    if trimmed.is_empty() || trimmed.starts_with("total ") {
        return Ok(None);
    }
    let invalid = || DiskError::ListingParse {
        line: trimmed.to_string(),
    };

    // mode, links, owner, group
    let (head, rest) = split_fields(trimmed, 4).ok_or_else(invalid)?;
    if !looks_like_mode(head[0]) {
        return Err(invalid());
    }
    let permissions = head[0].to_string();
    let is_device = permissions.starts_with('c') || permissions.starts_with('b');

    let (size, rest) = if is_device {
        // "1,   3" or "1,3"
        let (major, rest) = split_fields(rest, 1).ok_or_else(invalid)?;
        let rest = if major[0].ends_with(',') && major[0].len() > 1 {
            split_fields(rest, 1).ok_or_else(invalid)?.1
        } else if major[0].contains(',') {
            rest
        } else {
            return Err(invalid());
        };
        (0, rest)
    } else {
        let (size, rest) = split_fields(rest, 1).ok_or_else(invalid)?;
        (size[0].parse::<u64>().map_err(|_| invalid())?, rest)
    };

    let date_fields = match split_fields(rest, 1) {
        Some((first, _)) if first[0].len() == 10 && first[0].as_bytes()[4] == b'-' => 2,
        Some(_) => 3,
        None => return Err(invalid()),
    };
    let (_, name_field) = split_fields(rest, date_fields).ok_or_else(invalid)?;
    if name_field.is_empty() {
        return Err(invalid());
    }

    let is_symlink = permissions.starts_with('l');
    let (name, link_target) = match name_field.split_once(" -> ") {
        Some((name, target)) if is_symlink => (name.to_string(), Some(target.to_string())),
        _ => (name_field.to_string(), None),
    };
    if name == "." || name == ".." {
        return Ok(None);
    }

    Ok(Some(FileEntry {
        name,
        size,
        is_dir: permissions.starts_with('d'),
        is_symlink,
        permissions,
        link_target,
    }))
}

/// Parse full `ls -la` output, skipping the total line and dot entries
pub fn parse_listing(output: &str) -> Result<Vec<FileEntry>, DiskError> {
    let mut entries = Vec::new();
    for line in output.lines() {
        if let Some(entry) = parse_listing_line(line)? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

impl<E: CommandExecutor> DiskEngine<E> {
    /// Atomically write `content` to `path`, creating parent directories
    pub async fn write_file(
        &self,
        path: &Path,
        content: &[u8],
        mode: Option<u32>,
    ) -> Result<(), DiskError> {
        let tmp = shell_quote(&arg(&self.temp_sibling(path)));
        let target = shell_quote(&arg(path));
        let chmod = mode
            .map(|m| format!("chmod {m:o} {tmp} && "))
            .unwrap_or_default();
        let script = format!(
            "mkdir -p {dir} && base64 -d > {tmp} && {chmod}mv -f {tmp} {target} || {{ rm -f {tmp}; exit 1; }}",
            dir = shell_quote(&parent_dir(path)),
        );

        tracing::debug!(path = %path.display(), bytes = content.len(), "writing file");
        self.run_op(
            "write file",
            CommandRequest::shell(script).with_stdin(encode_wrapped(content)),
        )
        .await?;
        Ok(())
    }

    /// Read the full content of `path`
    pub async fn read_file(&self, path: &Path) -> Result<Vec<u8>, DiskError> {
        let output = self
            .run_op("read file", CommandRequest::new(["base64", &arg(path)]))
            .await?;
        decode_output(path, &output.stdout)
    }

    /// Read `path` as UTF-8 text
    pub async fn read_to_string(&self, path: &Path) -> Result<String, DiskError> {
        let bytes = self.read_file(path).await?;
        String::from_utf8(bytes).map_err(|e| DiskError::Decode {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Copy `from` to `to` through a temporary sibling, preserving attributes
    pub async fn copy_file(&self, from: &Path, to: &Path) -> Result<(), DiskError> {
        let tmp = shell_quote(&arg(&self.temp_sibling(to)));
        let script = format!(
            "mkdir -p {dir} && cp -a {src} {tmp} && mv -f {tmp} {dst} || {{ rm -f {tmp}; exit 1; }}",
            dir = shell_quote(&parent_dir(to)),
            src = shell_quote(&arg(from)),
            dst = shell_quote(&arg(to)),
        );
        self.run_op("copy file", CommandRequest::shell(script)).await?;
        Ok(())
    }

    /// Whether `path` exists
    pub async fn exists(&self, path: &Path) -> Result<bool, DiskError> {
        self.probe_op("check path", CommandRequest::new(["test", "-e", &arg(path)]))
            .await
    }

    /// List the entries of `dir`
    pub async fn list_files(&self, dir: &Path) -> Result<Vec<FileEntry>, DiskError> {
        let output = self
            .run_op("list files", CommandRequest::new(["ls", "-la", &arg(dir)]))
            .await?;
        parse_listing(&output.stdout)
    }

    /// Absolute paths of the entries of `dir`
    pub async fn list_paths(&self, dir: &Path) -> Result<Vec<PathBuf>, DiskError> {
        Ok(self
            .list_files(dir)
            .await?
            .into_iter()
            .map(|entry| dir.join(entry.name))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_gnu_listing() {
        let out = "total 16\n\
drwxr-xr-x  4 root root 4096 Jan  5 10:00 .\n\
drwxr-xr-x 19 root root 4096 Jan  5 10:00 ..\n\
-rw-r--r--  1 root root  220 Jan  5 10:00 hostname\n\
drwxr-xr-x  2 root root 4096 Jan  5 10:00 netplan\n\
lrwxrwxrwx  1 root root   39 Jan  5 10:00 resolv.conf -> ../run/systemd/resolve/stub-resolv.conf\n";
        let entries = parse_listing(out).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "hostname");
        assert_eq!(entries[0].size, 220);
        assert!(entries[1].is_dir);
        assert!(entries[2].is_symlink);
        assert_eq!(entries[2].name, "resolv.conf");
        assert_eq!(
            entries[2].link_target.as_deref(),
            Some("../run/systemd/resolve/stub-resolv.conf")
        );
    }

    #[test]
    fn test_busybox_listing_with_devices() {
        let out = "drwxr-xr-x    2 0        0              0 Jan  1 00:00 .\n\
crw-rw-rw-    1 0        0           1,   3 Jan  1 00:00 null\n\
brw-rw----    1 0        6         179,   0 Jan  1 00:00 mmcblk0\n\
-rwxr-xr-x    1 0        0         812344 Jan  1 00:00 busybox\n";
        let entries = parse_listing(out).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "null");
        assert_eq!(entries[0].size, 0);
        assert_eq!(entries[1].name, "mmcblk0");
        assert_eq!(entries[2].size, 812344);
    }

    #[test]
    fn test_iso_timestamps_and_spaces_in_names() {
        let out = "-rw-r--r-- 1 root root 5 2024-01-31 12:00 my file.txt\n";
        let entries = parse_listing(out).unwrap();
        assert_eq!(entries[0].name, "my file.txt");
    }

    #[test]
    fn test_compact_device_column() {
        let entry = parse_listing_line("crw------- 1 root root 5,1 Jan 1 00:00 console")
            .unwrap()
            .unwrap();
        assert_eq!(entry.name, "console");
    }

    #[test]
    fn test_garbage_line_is_an_error() {
        assert!(matches!(
            parse_listing("not a listing"),
            Err(DiskError::ListingParse { .. })
        ));
    }

    #[test]
    fn test_encode_wraps_lines() {
        let encoded = encode_wrapped(&[0u8; 200]);
        assert!(encoded.lines().all(|l| l.len() <= BASE64_LINE_WIDTH));
        assert_eq!(
            decode_output(Path::new("x"), &encoded).unwrap(),
            vec![0u8; 200]
        );
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir(Path::new("/etc/hostname")), "/etc");
        assert_eq!(parent_dir(Path::new("hostname")), ".");
    }

    proptest! {
        #[test]
        fn prop_listing_name_survives(name in "[a-zA-Z0-9._-][a-zA-Z0-9 ._-]{0,30}[a-zA-Z0-9_-]", size in 0u64..1_000_000_000) {
            prop_assume!(name != "." && name != "..");
            let line = format!("-rw-r--r-- 1 root root {size} Mar 14 09:26 {name}");
            let entry = parse_listing_line(&line).unwrap().unwrap();
            prop_assert_eq!(entry.name, name);
            prop_assert_eq!(entry.size, size);
        }
    }
}
