//! Archive validation, safe extraction and payload classification.
//!
//! Everything here is blocking filesystem work; async callers run it on
//! `spawn_blocking`.

use std::{
    fmt, fs,
    io::{self, Read},
    path::{Component, Path, PathBuf},
};

use spawnpoint_instance::DeploymentMode;

use crate::error::{Error, Result};

/// Root-level file that marks a ready-to-run server payload.
pub const SERVER_JAR: &str = "server.jar";
/// Root-level directory that marks an overlay-only payload.
pub const OVERLAY_DIR: &str = "plugins";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zip => f.write_str("zip"),
            Self::Tar => f.write_str("tar"),
            Self::TarGz => f.write_str("tar.gz"),
        }
    }
}

/// A validated archive ready for extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveBundle {
    pub source: PathBuf,
    pub format: ArchiveFormat,
}

/// Recognized formats that have no extractor.
const UNSUPPORTED_FORMATS: &[&str] = &["7z"];

pub fn detect_format(path: &Path) -> Result<ArchiveFormat> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        return Ok(ArchiveFormat::TarGz);
    }
    if name.ends_with(".tar") {
        return Ok(ArchiveFormat::Tar);
    }
    if name.ends_with(".zip") {
        return Ok(ArchiveFormat::Zip);
    }
    if let Some(ext) = UNSUPPORTED_FORMATS
        .iter()
        .find(|ext| name.ends_with(&format!(".{ext}")))
    {
        return Err(Error::UnsupportedFormat {
            path: path.to_path_buf(),
            format: (*ext).to_string(),
        });
    }
    Err(Error::validation(
        path.display().to_string(),
        "unrecognized archive extension (expected .zip, .tar, .tar.gz or .tgz)",
    ))
}

/// Checks that `path` is a readable regular file with a supported extension.
pub fn validate(path: &Path) -> Result<ArchiveBundle> {
    let subject = path.display().to_string();
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::validation(subject, "file does not exist"));
        }
        Err(e) => return Err(Error::validation(subject, format!("cannot stat file: {e}"))),
    };
    if !meta.is_file() {
        return Err(Error::validation(subject, "not a regular file"));
    }
    if let Err(e) = fs::File::open(path) {
        return Err(Error::validation(subject, format!("file is not readable: {e}")));
    }

    let format = detect_format(path)?;
    Ok(ArchiveBundle {
        source: path.to_path_buf(),
        format,
    })
}

fn normalize_rel_path(raw: &str) -> std::result::Result<PathBuf, &'static str> {
    let p = Path::new(raw);
    if p.is_absolute() {
        return Err("absolute path");
    }
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => return Err("path traversal"),
            Component::Prefix(_) | Component::RootDir => return Err("absolute path"),
        }
    }
    Ok(out)
}

/// Resolves an archive entry name to a path under `root` (which must already
/// be canonical), creating the parent directories on the way.
fn safe_entry_path(archive: &Path, root: &Path, raw: &str) -> Result<Option<PathBuf>> {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(None);
    }
    let rel = normalize_rel_path(trimmed).map_err(|why| {
        Error::extraction(archive, format!("entry {raw:?} rejected: {why}"))
    })?;
    if rel.as_os_str().is_empty() {
        return Ok(None);
    }

    let out = root.join(&rel);
    let parent = out.parent().unwrap_or(root);
    fs::create_dir_all(parent)
        .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
    let parent = fs::canonicalize(parent)
        .map_err(|e| Error::io(format!("resolve {}", parent.display()), e))?;
    if !parent.starts_with(root) {
        return Err(Error::extraction(
            archive,
            format!("entry {raw:?} resolves outside the destination"),
        ));
    }
    Ok(Some(out))
}

fn write_entry(archive: &Path, out: &Path, reader: &mut impl Read) -> Result<()> {
    if out.is_dir() {
        return Err(Error::extraction(
            archive,
            format!("{} is both a directory and a file", out.display()),
        ));
    }
    let mut f = fs::File::create(out)
        .map_err(|e| Error::io(format!("create {}", out.display()), e))?;
    io::copy(reader, &mut f).map_err(|e| Error::Extraction {
        path: archive.to_path_buf(),
        reason: format!("read entry for {}", out.display()),
        source: Some(Box::new(e)),
    })?;
    Ok(())
}

fn extract_zip(archive_path: &Path, root: &Path) -> Result<()> {
    let corrupt = |e: zip::result::ZipError| Error::Extraction {
        path: archive_path.to_path_buf(),
        reason: "corrupt zip archive".to_string(),
        source: Some(Box::new(e)),
    };

    let f = fs::File::open(archive_path)
        .map_err(|e| Error::io(format!("open {}", archive_path.display()), e))?;
    let mut archive = zip::ZipArchive::new(f).map_err(corrupt)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(corrupt)?;
        let name = file.name().to_string();
        let Some(out) = safe_entry_path(archive_path, root, &name)? else {
            continue;
        };
        if file.is_dir() {
            fs::create_dir_all(&out)
                .map_err(|e| Error::io(format!("create {}", out.display()), e))?;
            continue;
        }
        write_entry(archive_path, &out, &mut file)?;
    }
    Ok(())
}

fn extract_tar<R: Read>(archive_path: &Path, reader: R, root: &Path) -> Result<()> {
    let corrupt = |e: io::Error| Error::Extraction {
        path: archive_path.to_path_buf(),
        reason: "corrupt tar archive".to_string(),
        source: Some(Box::new(e)),
    };

    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let name = entry.path().map_err(corrupt)?.to_string_lossy().into_owned();
        let kind = entry.header().entry_type();

        if kind.is_symlink() || kind.is_hard_link() {
            tracing::warn!(
                archive = %archive_path.display(),
                entry = %name,
                "skipping link entry"
            );
            continue;
        }

        let Some(out) = safe_entry_path(archive_path, root, &name)? else {
            continue;
        };
        if kind.is_dir() {
            fs::create_dir_all(&out)
                .map_err(|e| Error::io(format!("create {}", out.display()), e))?;
        } else if kind.is_file() {
            write_entry(archive_path, &out, &mut entry)?;
        } else {
            tracing::debug!(entry = %name, kind = ?kind, "skipping special tar entry");
        }
    }
    Ok(())
}

/// Extracts `bundle` into `dest`. Every entry is checked to stay inside
/// `dest`; one bad entry fails the whole extraction.
pub fn extract(bundle: &ArchiveBundle, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(|e| Error::io(format!("create {}", dest.display()), e))?;
    let root = fs::canonicalize(dest)
        .map_err(|e| Error::io(format!("resolve {}", dest.display()), e))?;

    match bundle.format {
        ArchiveFormat::Zip => extract_zip(&bundle.source, &root),
        ArchiveFormat::Tar | ArchiveFormat::TarGz => {
            let f = fs::File::open(&bundle.source)
                .map_err(|e| Error::io(format!("open {}", bundle.source.display()), e))?;
            let reader = io::BufReader::new(f);
            if bundle.format == ArchiveFormat::TarGz {
                extract_tar(&bundle.source, flate2::read::GzDecoder::new(reader), &root)
            } else {
                extract_tar(&bundle.source, reader, &root)
            }
        }
    }
}

fn is_ignorable(name: &str) -> bool {
    name == "__MACOSX" || name == ".DS_Store"
}

/// When the payload was packed inside one wrapper directory, returns it.
fn find_flatten_root(extracted: &Path) -> Option<PathBuf> {
    let rd = fs::read_dir(extracted).ok()?;
    let mut entries: Vec<PathBuf> = rd
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            let name = p.file_name().and_then(|s| s.to_str()).unwrap_or("");
            !is_ignorable(name)
        })
        .collect();
    if entries.len() != 1 {
        return None;
    }
    let only = entries.remove(0);
    let name = only.file_name().and_then(|s| s.to_str()).unwrap_or("");
    if name == OVERLAY_DIR || !only.is_dir() {
        return None;
    }
    Some(only)
}

/// Lifts the contents of a single wrapper directory into `dest`.
pub fn flatten(dest: &Path) -> Result<()> {
    let Some(wrapper) = find_flatten_root(dest) else {
        return Ok(());
    };
    let io_err = |what: &str, p: &Path, e: io::Error| Error::io(format!("{what} {}", p.display()), e);

    // Move the wrapper aside first so a child with the same name can take
    // its place.
    let staging = dest.join(".spawnpoint-flatten");
    fs::rename(&wrapper, &staging).map_err(|e| io_err("rename", &wrapper, e))?;

    for e in fs::read_dir(&staging).map_err(|e| io_err("read", &staging, e))? {
        let e = e.map_err(|e| io_err("read", &staging, e))?;
        let dst = dest.join(e.file_name());
        if dst.exists() {
            return Err(Error::extraction(
                dest,
                format!("flattening would overwrite {}", dst.display()),
            ));
        }
        fs::rename(e.path(), &dst).map_err(|err| io_err("move", &e.path(), err))?;
    }
    fs::remove_dir_all(&staging).map_err(|e| io_err("remove", &staging, e))?;
    tracing::debug!(wrapper = %wrapper.display(), "flattened single top-level directory");
    Ok(())
}

pub fn classify(dest: &Path) -> Result<DeploymentMode> {
    if dest.join(SERVER_JAR).is_file() {
        return Ok(DeploymentMode::FullDistribution);
    }
    if dest.join(OVERLAY_DIR).is_dir() {
        return Ok(DeploymentMode::OverlayOnly);
    }
    Err(Error::DeploymentClassification {
        dir: dest.to_path_buf(),
        jar: SERVER_JAR,
        overlay: OVERLAY_DIR,
    })
}

fn log_tree(dir: &Path, depth: usize) {
    const MAX_DEPTH: usize = 3;
    let Ok(rd) = fs::read_dir(dir) else {
        return;
    };
    let mut entries = rd.flatten().collect::<Vec<_>>();
    entries.sort_by_key(|e| e.file_name());
    for e in entries {
        let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let indent = "  ".repeat(depth);
        let suffix = if is_dir { "/" } else { "" };
        tracing::debug!("{indent}{}{suffix}", e.file_name().to_string_lossy());
        if is_dir && depth < MAX_DEPTH {
            log_tree(&e.path(), depth + 1);
        }
    }
}

/// Extract, flatten and classify in one go.
pub fn ingest(bundle: &ArchiveBundle, dest: &Path) -> Result<DeploymentMode> {
    extract(bundle, dest)?;
    flatten(dest)?;
    if tracing::enabled!(tracing::Level::DEBUG) {
        tracing::debug!(dest = %dest.display(), "extracted payload:");
        log_tree(dest, 1);
    }
    let mode = classify(dest)?;
    tracing::info!(
        archive = %bundle.source.display(),
        format = %bundle.format,
        mode = %mode,
        "archive ingested"
    );
    Ok(mode)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    use super::*;
    use crate::test_support::temp_dir_for;

    fn write_zip(path: &Path, files: &[(&str, &str)], dirs: &[&str]) {
        let f = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(f);
        for d in dirs {
            zip.add_directory(*d, SimpleFileOptions::default()).unwrap();
        }
        for (name, data) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    /// Appends an entry with a raw name, bypassing the builder's own path checks.
    fn append_raw<W: Write>(
        builder: &mut tar::Builder<W>,
        name: &str,
        kind: tar::EntryType,
        data: &[u8],
    ) {
        let mut header = tar::Header::new_gnu();
        let raw = name.as_bytes();
        header.as_old_mut().name[..raw.len()].copy_from_slice(raw);
        header.set_size(data.len() as u64);
        header.set_mode(if kind.is_dir() { 0o755 } else { 0o644 });
        header.set_entry_type(kind);
        header.set_cksum();
        builder.append(&header, data).unwrap();
    }

    fn setup(test: &str) -> (PathBuf, PathBuf) {
        let base = temp_dir_for(test);
        fs::create_dir_all(&base).unwrap();
        let dest = base.join("out");
        (base, dest)
    }

    #[test]
    fn detects_formats_case_insensitively() {
        assert_eq!(detect_format(Path::new("a/Pack.ZIP")).unwrap(), ArchiveFormat::Zip);
        assert_eq!(detect_format(Path::new("a.tar")).unwrap(), ArchiveFormat::Tar);
        assert_eq!(detect_format(Path::new("a.Tar.Gz")).unwrap(), ArchiveFormat::TarGz);
        assert_eq!(detect_format(Path::new("a.tgz")).unwrap(), ArchiveFormat::TarGz);
    }

    #[test]
    fn seven_zip_is_unsupported_not_invalid() {
        let err = detect_format(Path::new("server.7z")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { ref format, .. } if format == "7z"));

        let err = detect_format(Path::new("server.rar")).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn validate_rejects_missing_and_directories() {
        let (base, _) = setup("validate");
        let err = validate(&base.join("nope.zip")).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let dir = base.join("folder.zip");
        fs::create_dir_all(&dir).unwrap();
        let err = validate(&dir).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn zip_with_server_jar_is_full_distribution() {
        let (base, dest) = setup("zip-full");
        let archive = base.join("server.zip");
        write_zip(&archive, &[("server.jar", "jar"), ("eula.txt", "eula=true")], &[]);

        let bundle = validate(&archive).unwrap();
        assert_eq!(ingest(&bundle, &dest).unwrap(), DeploymentMode::FullDistribution);
        assert_eq!(fs::read(dest.join("eula.txt")).unwrap(), b"eula=true");

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn wrapped_payload_is_flattened() {
        let (base, dest) = setup("zip-wrapped");
        let archive = base.join("wrapped.zip");
        write_zip(
            &archive,
            &[("my-server/server.jar", "jar"), ("my-server/my-server/x.txt", "x")],
            &["my-server/"],
        );

        let bundle = validate(&archive).unwrap();
        assert_eq!(ingest(&bundle, &dest).unwrap(), DeploymentMode::FullDistribution);
        assert!(dest.join("server.jar").is_file());
        assert!(dest.join("my-server/x.txt").is_file());

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn lone_plugins_dir_is_overlay_and_not_flattened() {
        let (base, dest) = setup("tgz-overlay");
        let archive = base.join("plugins.tar.gz");
        {
            let f = fs::File::create(&archive).unwrap();
            let gz = flate2::write::GzEncoder::new(f, flate2::Compression::default());
            let mut builder = tar::Builder::new(gz);
            append_raw(&mut builder, "plugins/", tar::EntryType::Directory, b"");
            append_raw(&mut builder, "plugins/Essentials.jar", tar::EntryType::Regular, b"p");
            builder.into_inner().unwrap().finish().unwrap();
        }

        let bundle = validate(&archive).unwrap();
        assert_eq!(bundle.format, ArchiveFormat::TarGz);
        assert_eq!(ingest(&bundle, &dest).unwrap(), DeploymentMode::OverlayOnly);
        assert!(dest.join("plugins/Essentials.jar").is_file());

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn payload_without_markers_fails_classification() {
        let (base, dest) = setup("zip-none");
        let archive = base.join("junk.zip");
        write_zip(&archive, &[("readme.txt", "hi"), ("world/level.dat", "")], &[]);

        let bundle = validate(&archive).unwrap();
        let err = ingest(&bundle, &dest).unwrap_err();
        assert!(matches!(err, Error::DeploymentClassification { .. }));

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn zip_slip_file_entry_is_rejected() {
        let (base, dest) = setup("zip-slip-file");
        let archive = base.join("evil.zip");
        write_zip(&archive, &[("server.jar", "jar"), ("../../etc/passwd", "root")], &[]);

        let err = extract(&validate(&archive).unwrap(), &dest).unwrap_err();
        assert!(matches!(err, Error::Extraction { .. }), "{err}");
        assert!(!base.join("etc").exists());

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn zip_slip_directory_entry_is_rejected() {
        let (base, dest) = setup("zip-slip-dir");
        let archive = base.join("evil.zip");
        write_zip(&archive, &[], &["../escape/"]);

        let err = extract(&validate(&archive).unwrap(), &dest).unwrap_err();
        assert!(matches!(err, Error::Extraction { .. }), "{err}");
        assert!(!base.join("escape").exists());

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn tar_traversal_entries_are_rejected() {
        for (i, (name, kind)) in [
            ("../../etc/passwd", tar::EntryType::Regular),
            ("../escape/", tar::EntryType::Directory),
            ("/abs/file", tar::EntryType::Regular),
        ]
        .into_iter()
        .enumerate()
        {
            let (base, dest) = setup(&format!("tar-slip-{i}"));
            let archive = base.join("evil.tar");
            {
                let f = fs::File::create(&archive).unwrap();
                let mut builder = tar::Builder::new(f);
                append_raw(&mut builder, name, kind, b"data");
                builder.finish().unwrap();
            }

            let err = extract(&validate(&archive).unwrap(), &dest).unwrap_err();
            assert!(matches!(err, Error::Extraction { .. }), "{name}: {err}");
            let _ = fs::remove_dir_all(&base);
        }
    }

    #[test]
    fn tar_symlinks_are_skipped() {
        let (base, dest) = setup("tar-symlink");
        let archive = base.join("links.tar");
        {
            let f = fs::File::create(&archive).unwrap();
            let mut builder = tar::Builder::new(f);
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            builder
                .append_link(&mut header, "passwd", "/etc/passwd")
                .unwrap();
            append_raw(&mut builder, "server.jar", tar::EntryType::Regular, b"jar");
            builder.finish().unwrap();
        }

        extract(&validate(&archive).unwrap(), &dest).unwrap();
        assert!(dest.join("server.jar").is_file());
        assert!(fs::symlink_metadata(dest.join("passwd")).is_err());

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn corrupt_zip_is_an_extraction_error() {
        let (base, dest) = setup("zip-corrupt");
        let archive = base.join("broken.zip");
        fs::write(&archive, b"definitely not a zip file").unwrap();

        let err = extract(&validate(&archive).unwrap(), &dest).unwrap_err();
        assert!(matches!(err, Error::Extraction { .. }));

        let _ = fs::remove_dir_all(&base);
    }
}
