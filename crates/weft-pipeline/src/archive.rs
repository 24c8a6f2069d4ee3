//! Zip snapshots of a component's source tree.

use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::PipelineError;
use crate::watcher::IGNORED_DIRS;

fn should_walk_dir_entry(entry: &walkdir::DirEntry) -> bool {
    if !entry.file_type().is_dir() || entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    !IGNORED_DIRS.contains(&name.as_ref())
}

/// Archive everything under `root` except dependency and build output
/// directories. Entries are sorted, so equal trees give equal bytes.
pub fn archive_dir(root: &Path) -> Result<Vec<u8>, PipelineError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut files = 0usize;

    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(should_walk_dir_entry)
    {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.depth() == 0 {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let name = archive_name(relative);
        if entry.file_type().is_dir() {
            zip.add_directory(format!("{name}/"), options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            let mut file = std::fs::File::open(entry.path())?;
            std::io::copy(&mut file, &mut zip)?;
            files += 1;
        }
    }

    let bytes = zip.finish()?.into_inner();
    tracing::debug!(root = %root.display(), files, bytes = bytes.len(), "Archived source tree");
    Ok(bytes)
}

/// Forward-slash path inside the archive.
fn archive_name(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Unpack `bytes` into `out_dir`. Entries that would land outside it are
/// rejected before anything is written for them.
pub fn extract_archive(bytes: &[u8], out_dir: &Path) -> Result<usize, PipelineError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    std::fs::create_dir_all(out_dir)?;
    let mut files = 0usize;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let rel = sanitize_rel_path(Path::new(file.name()))?;
        let out_path = out_dir.join(rel);
        if file.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut contents)?;
        std::fs::File::create(&out_path)?.write_all(&contents)?;
        files += 1;
    }
    Ok(files)
}

fn sanitize_rel_path(path: &Path) -> Result<PathBuf, PipelineError> {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(_) | Component::RootDir => {
                return Err(PipelineError::UnsafeArchivePath(format!(
                    "absolute path {}",
                    path.display()
                )));
            }
            Component::ParentDir => {
                return Err(PipelineError::UnsafeArchivePath(format!(
                    "parent reference in {}",
                    path.display()
                )));
            }
            Component::CurDir => {}
            Component::Normal(p) => out.push(p),
        }
    }
    Ok(out)
}
