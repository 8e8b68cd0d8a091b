use std::fs;
use std::io::{self, Read, Write};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use tempfile::Builder;

use crate::error::HarvestError;

/// The local tree of downloaded datasets: one folder per dataset under the
/// save directory.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: Utf8PathBuf,
}

impl DatasetStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn dataset_dir(&self, dataset: &str) -> Utf8PathBuf {
        self.root.join(dataset)
    }

    pub fn ensure_root(&self) -> Result<(), HarvestError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))
    }

    pub fn ensure_dataset_dir(&self, dataset: &str) -> Result<Utf8PathBuf, HarvestError> {
        let dir = self.dataset_dir(dataset);
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        Ok(dir)
    }

    /// Non-hidden dataset folders, sorted by name.
    pub fn dataset_dirs(&self) -> Result<Vec<Utf8PathBuf>, HarvestError> {
        let root_path = self.root.as_std_path().to_path_buf();
        let entries = fs::read_dir(&root_path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => HarvestError::RootNotFound(root_path.clone()),
            _ => HarvestError::RootUnreadable {
                path: root_path.clone(),
                message: err.to_string(),
            },
        })?;
        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                tracing::warn!(path = %entry.path().display(), "skipping non-utf8 dataset folder");
                continue;
            };
            if path.as_std_path().is_dir() && !is_hidden(&path) {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), HarvestError> {
        Self::write_stream_atomic(path, &mut io::Cursor::new(content)).map(|_| ())
    }

    /// Streams `reader` into a temp file next to `path`, then renames it into
    /// place. Returns the number of bytes written.
    pub fn write_stream_atomic<R: Read>(
        path: &Utf8Path,
        reader: &mut R,
    ) -> Result<u64, HarvestError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            Some(_) => Utf8Path::new("."),
            None => {
                return Err(HarvestError::Filesystem(format!(
                    "invalid destination path {path}"
                )));
            }
        };
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(".imgharvest-part")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let written = io::copy(reader, &mut temp)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        temp.flush()
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        Ok(written)
    }

    pub fn remove_dir_if_exists(path: &Utf8Path) -> Result<bool, HarvestError> {
        match fs::remove_dir_all(path.as_std_path()) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(HarvestError::Filesystem(err.to_string())),
        }
    }
}

/// A `/`-separated remote key as a path below a dataset folder. Every
/// segment must be a plain name: empty, `.` and `..` segments, backslashes
/// and absolute keys are rejected.
pub fn relative_key_path(key: &str) -> Result<Utf8PathBuf, HarvestError> {
    let plain = |segment: &str| {
        !segment.contains('\\')
            && matches!(
                Utf8Path::new(segment).components().collect::<Vec<_>>().as_slice(),
                [Utf8Component::Normal(name)] if *name == segment
            )
    };
    if key.is_empty() || !key.split('/').all(plain) {
        return Err(HarvestError::UnsafeRemoteKey(key.to_string()));
    }
    Ok(Utf8PathBuf::from(key))
}

fn is_hidden(path: &Utf8Path) -> bool {
    path.file_name()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_visible_dataset_dirs_in_order() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = DatasetStore::new(root.clone());
        for name in ["omero_1", ".cache", "empiar_2"] {
            store.ensure_dataset_dir(name).unwrap();
        }
        fs::write(root.join("notes.txt").as_std_path(), b"x").unwrap();

        let dirs = store.dataset_dirs().unwrap();
        let names: Vec<_> = dirs.iter().filter_map(|dir| dir.file_name()).collect();
        assert_eq!(names, vec!["empiar_2", "omero_1"]);
    }

    #[test]
    fn atomic_write_replaces_existing_file() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let path = root.join("a/b/file.bin");
        DatasetStore::write_bytes_atomic(&path, b"first").unwrap();
        DatasetStore::write_bytes_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(path.as_std_path()).unwrap(), b"second");
    }

    #[test]
    fn remote_keys_must_stay_inside_the_dataset_folder() {
        assert_eq!(
            relative_key_path("recon-2/em/s0/.zarray").unwrap(),
            Utf8PathBuf::from("recon-2/em/s0/.zarray")
        );
        for key in [
            "",
            "/tmp/evil/.zarray",
            "store//tmp/evil",
            "../../escape/.zarray",
            "a/./b",
            "a/..",
            "a\\..\\b",
        ] {
            assert!(relative_key_path(key).is_err(), "{key} accepted");
        }
    }
}
