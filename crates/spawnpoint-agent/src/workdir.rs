use std::{fs, io, path::Path};

use crate::error::{Error, Result};

/// Creates `path` (and its parents). Fails if something other than a
/// directory already sits there.
pub fn create(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => {
            return Err(Error::io(
                format!("create working directory {}", path.display()),
                io::Error::new(io::ErrorKind::AlreadyExists, "path exists and is not a directory"),
            ));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::io(format!("stat {}", path.display()), e));
        }
    }
    fs::create_dir_all(path)
        .map_err(|e| Error::io(format!("create working directory {}", path.display()), e))
}

/// Recursive, best-effort removal. Never fails; problems are only logged.
pub fn delete(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => tracing::debug!(dir = %path.display(), "working directory removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(dir = %path.display(), "working directory already gone");
        }
        Err(e) => {
            tracing::warn!(dir = %path.display(), error = %e, "failed to remove working directory");
            // Whatever could not go in one pass gets a second chance, file
            // by file.
            remove_leftovers(path);
        }
    }
}

fn remove_leftovers(dir: &Path) {
    let Ok(rd) = fs::read_dir(dir) else {
        return;
    };
    for e in rd.flatten() {
        let p = e.path();
        let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let res = if is_dir {
            remove_leftovers(&p);
            fs::remove_dir(&p)
        } else {
            fs::remove_file(&p)
        };
        if let Err(err) = res {
            tracing::warn!(path = %p.display(), error = %err, "could not remove");
        }
    }
    let _ = fs::remove_dir(dir);
}
