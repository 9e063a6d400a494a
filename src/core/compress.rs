//! Image compression
//!
//! Decompresses a source image into a per-node working copy and compresses
//! the customised copy for transfer. The compressed source is only ever
//! read; every output goes to a temporary file renamed into place.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{CompressError, ExecError};
use crate::infra::executor::{shell_quote, CommandExecutor, CommandRequest};

/// Disk image suffixes looked for inside tar archives
const IMAGE_SUFFIXES: &[&str] = &[".img", ".raw"];

/// Compression format of an image artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Compression {
    None,
    Xz,
    Gzip,
    TarGz,
}

impl Compression {
    /// Detect from the file name suffix
    pub fn detect(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Compression::TarGz
        } else if name.ends_with(".xz") {
            Compression::Xz
        } else if name.ends_with(".gz") {
            Compression::Gzip
        } else {
            Compression::None
        }
    }

    /// File name with this format's suffix removed
    pub fn strip_suffix(&self, name: &str) -> String {
        let lower = name.to_lowercase();
        let cut = match self {
            Compression::None => 0,
            Compression::Xz => ".xz".len(),
            Compression::Gzip => ".gz".len(),
            Compression::TarGz if lower.ends_with(".tgz") => ".tgz".len(),
            Compression::TarGz => ".tar.gz".len(),
        };
        name[..name.len() - cut].to_string()
    }

    /// Suffix appended when compressing in this format
    pub fn suffix(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Xz => ".xz",
            Compression::Gzip => ".gz",
            Compression::TarGz => ".tar.gz",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Xz => write!(f, "xz"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::TarGz => write!(f, "tar.gz"),
        }
    }
}

/// An image moving through the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageArtifact {
    /// Original source, never modified
    pub source: PathBuf,
    /// Raw working copy
    pub decompressed: PathBuf,
    /// Compressed output, once produced
    pub compressed: Option<PathBuf>,
    /// Size of the working copy in bytes
    pub size: u64,
}

/// Size change from a compression
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompressionStats {
    /// Raw size in bytes
    pub original_size: u64,
    /// Compressed size in bytes
    pub compressed_size: u64,
}

impl CompressionStats {
    /// Space saved as a percentage
    pub fn ratio(&self) -> f64 {
        if self.original_size == 0 {
            0.0
        } else {
            (1.0 - (self.compressed_size as f64 / self.original_size as f64)) * 100.0
        }
    }

    /// Bytes saved
    pub fn bytes_saved(&self) -> u64 {
        self.original_size.saturating_sub(self.compressed_size)
    }
}

fn command_err(operation: &str, path: &Path) -> impl FnOnce(ExecError) -> CompressError {
    let operation = operation.to_string();
    let path = path.to_path_buf();
    move |source| CompressError::Command {
        operation,
        path,
        source,
    }
}

fn quoted(path: &Path) -> String {
    shell_quote(&path.display().to_string())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

/// Byte size of a file as seen by the executor
pub async fn file_size<E: CommandExecutor + ?Sized>(
    exec: &E,
    path: &Path,
) -> Result<u64, CompressError> {
    let output = exec
        .check(CommandRequest::new(["stat", "-c", "%s", &path.display().to_string()]))
        .await
        .map_err(command_err("stat", path))?;
    output
        .stdout
        .trim()
        .parse()
        .map_err(|_| CompressError::Size {
            path: path.to_path_buf(),
            output: output.stdout.trim().to_string(),
        })
}

/// Decompress `source` into `work_dir`
///
/// Uncompressed sources are copied so the working copy can be mutated
/// freely. Tar archives must contain an `.img` or `.raw` file.
pub async fn decompress<E: CommandExecutor + ?Sized>(
    exec: &E,
    source: &Path,
    work_dir: &Path,
) -> Result<ImageArtifact, CompressError> {
    let present = exec
        .probe(&["test", "-f", &source.display().to_string()])
        .await
        .map_err(command_err("decompress", source))?;
    if !present {
        return Err(CompressError::NotFound {
            path: source.to_path_buf(),
        });
    }

    let format = Compression::detect(source);
    let target = work_dir.join(format.strip_suffix(&file_name(source)));
    let tmp = work_dir.join(format!(".{}.partial", file_name(&target)));
    tracing::info!(source = %source.display(), target = %target.display(), format = %format, "decompressing image");

    exec.run(&["mkdir", "-p", &work_dir.display().to_string()])
        .await
        .map_err(command_err("decompress", source))?;

    let script = match format {
        Compression::None => format!("cp {} {}", quoted(source), quoted(&tmp)),
        Compression::Xz => format!("xz -dc {} > {}", quoted(source), quoted(&tmp)),
        Compression::Gzip => format!("gzip -dc {} > {}", quoted(source), quoted(&tmp)),
        Compression::TarGz => {
            let member = extract_tar_image(exec, source, work_dir).await?;
            format!("mv -f {} {}", quoted(&member), quoted(&tmp))
        }
    };
    let script = format!(
        "{script} && mv -f {tmp} {target} || {{ rm -f {tmp}; exit 1; }}",
        tmp = quoted(&tmp),
        target = quoted(&target),
    );
    exec.check(CommandRequest::shell(script))
        .await
        .map_err(command_err("decompress", source))?;

    if format == Compression::TarGz {
        let scratch = tar_scratch_dir(work_dir);
        if let Err(e) = exec
            .run(&["rm", "-rf", &scratch.display().to_string()])
            .await
        {
            tracing::warn!(dir = %scratch.display(), "failed to remove extraction directory: {}", e);
        }
    }

    let size = file_size(exec, &target).await?;
    Ok(ImageArtifact {
        source: source.to_path_buf(),
        decompressed: target,
        compressed: None,
        size,
    })
}

fn tar_scratch_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(".extract")
}

/// Extract a tar.gz and return the disk image inside it
async fn extract_tar_image<E: CommandExecutor + ?Sized>(
    exec: &E,
    archive: &Path,
    work_dir: &Path,
) -> Result<PathBuf, CompressError> {
    let scratch = tar_scratch_dir(work_dir);
    let script = format!(
        "rm -rf {dir} && mkdir -p {dir} && tar -xzf {archive} -C {dir}",
        dir = quoted(&scratch),
        archive = quoted(archive),
    );
    exec.check(CommandRequest::shell(script))
        .await
        .map_err(command_err("extract", archive))?;

    let listing = exec
        .run(&["find", &scratch.display().to_string(), "-type", "f"])
        .await
        .map_err(command_err("extract", archive))?;
    find_image_member(&listing.stdout).ok_or_else(|| CompressError::NoImageInArchive {
        archive: archive.to_path_buf(),
    })
}

/// First disk image in a `find` listing, by sorted path
pub fn find_image_member(listing: &str) -> Option<PathBuf> {
    let mut candidates: Vec<&str> = listing
        .lines()
        .map(str::trim)
        .filter(|l| {
            let lower = l.to_lowercase();
            IMAGE_SUFFIXES.iter().any(|s| lower.ends_with(s))
        })
        .collect();
    candidates.sort_unstable();
    candidates.first().map(PathBuf::from)
}

/// Compress the working copy, recording the output on the artifact
pub async fn compress<E: CommandExecutor + ?Sized>(
    exec: &E,
    artifact: &mut ImageArtifact,
    format: Compression,
) -> Result<CompressionStats, CompressError> {
    let image = artifact.decompressed.clone();
    let output = PathBuf::from(format!("{}{}", image.display(), format.suffix()));
    let tmp = PathBuf::from(format!("{}.partial", output.display()));

    let pipeline = match format {
        Compression::None => format!("cp {} {}", quoted(&image), quoted(&tmp)),
        Compression::Xz => format!("xz -T0 -c {} > {}", quoted(&image), quoted(&tmp)),
        Compression::Gzip => format!("gzip -c {} > {}", quoted(&image), quoted(&tmp)),
        Compression::TarGz => {
            let dir = image.parent().unwrap_or(Path::new("."));
            format!(
                "tar -czf {} -C {} {}",
                quoted(&tmp),
                quoted(dir),
                shell_quote(&file_name(&image))
            )
        }
    };

    tracing::info!(image = %image.display(), output = %output.display(), format = %format, "compressing image");
    let script = format!(
        "{pipeline} && mv -f {tmp} {out} || {{ rm -f {tmp}; exit 1; }}",
        tmp = quoted(&tmp),
        out = quoted(&output),
    );
    exec.check(CommandRequest::shell(script))
        .await
        .map_err(command_err("compress", &image))?;

    let stats = CompressionStats {
        original_size: file_size(exec, &image).await?,
        compressed_size: file_size(exec, &output).await?,
    };
    tracing::info!(
        output = %output.display(),
        ratio = %format!("{:.1}%", stats.ratio()),
        "image compressed"
    );
    artifact.size = stats.original_size;
    artifact.compressed = Some(output);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect() {
        assert_eq!(Compression::detect(Path::new("node1.img.xz")), Compression::Xz);
        assert_eq!(Compression::detect(Path::new("a.img.gz")), Compression::Gzip);
        assert_eq!(Compression::detect(Path::new("a.tar.gz")), Compression::TarGz);
        assert_eq!(Compression::detect(Path::new("a.TGZ")), Compression::TarGz);
        assert_eq!(Compression::detect(Path::new("a.img")), Compression::None);
    }

    #[test]
    fn test_strip_suffix() {
        assert_eq!(Compression::Xz.strip_suffix("node1.img.xz"), "node1.img");
        assert_eq!(Compression::TarGz.strip_suffix("os.tar.gz"), "os");
        assert_eq!(Compression::TarGz.strip_suffix("os.tgz"), "os");
        assert_eq!(Compression::None.strip_suffix("node1.img"), "node1.img");
    }

    #[test]
    fn test_find_image_member() {
        let listing = "/w/.extract/README\n/w/.extract/b/root.img\n/w/.extract/a/boot.IMG\n";
        assert_eq!(
            find_image_member(listing),
            Some(PathBuf::from("/w/.extract/a/boot.IMG"))
        );
        assert_eq!(find_image_member("/w/.extract/README\n"), None);
    }

    #[test]
    fn test_compression_stats() {
        let stats = CompressionStats {
            original_size: 1000,
            compressed_size: 250,
        };
        assert_eq!(stats.bytes_saved(), 750);
        assert!((stats.ratio() - 75.0).abs() < 0.01);
        assert_eq!(CompressionStats::default().ratio(), 0.0);
    }
}
