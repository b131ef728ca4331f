//! Local byte sources for assets referenced by canvas nodes.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use super::AssetError;

/// Binary asset plus the metadata sent ahead of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl Asset {
    /// Build an asset named after the last segment of `path`.
    pub fn from_path(path: &str, bytes: Vec<u8>) -> Self {
        let name = path.rsplit(['/', '\\']).next().unwrap_or(path).to_string();
        Self {
            mime_type: mime_type_for(path).to_string(),
            name,
            bytes,
        }
    }
}

/// Opaque store keyed by asset path.
pub trait AssetStore {
    fn contains(&self, path: &str) -> bool;
    fn load(&self, path: &str) -> Result<Option<Asset>, AssetError>;
    fn store(&mut self, path: &str, asset: &Asset) -> Result<(), AssetError>;
}

#[derive(Debug, Default)]
pub struct MemoryAssetStore {
    assets: HashMap<String, Asset>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, asset: Asset) {
        self.assets.insert(path.into(), asset);
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

impl AssetStore for MemoryAssetStore {
    fn contains(&self, path: &str) -> bool {
        self.assets.contains_key(path)
    }

    fn load(&self, path: &str) -> Result<Option<Asset>, AssetError> {
        Ok(self.assets.get(path).cloned())
    }

    fn store(&mut self, path: &str, asset: &Asset) -> Result<(), AssetError> {
        self.assets.insert(path.to_string(), asset.clone());
        Ok(())
    }
}

/// Assets as files below a root directory. Asset paths are relative.
#[derive(Debug, Clone)]
pub struct DirectoryAssetStore {
    root: PathBuf,
}

impl DirectoryAssetStore {
    /// Open (creating if needed) the directory at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, AssetError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an asset path into the root, refusing anything that escapes it.
    fn resolve(&self, path: &str) -> Result<PathBuf, AssetError> {
        let relative = Path::new(path);
        let mut resolved = self.root.clone();
        let mut segments = 0;
        for component in relative.components() {
            match component {
                Component::Normal(segment) => {
                    resolved.push(segment);
                    segments += 1;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(AssetError::InvalidPath(path.to_string()));
                }
            }
        }
        if segments == 0 {
            return Err(AssetError::InvalidPath(path.to_string()));
        }
        Ok(resolved)
    }
}

impl AssetStore for DirectoryAssetStore {
    fn contains(&self, path: &str) -> bool {
        self.resolve(path).is_ok_and(|p| p.is_file())
    }

    fn load(&self, path: &str) -> Result<Option<Asset>, AssetError> {
        let file = self.resolve(path)?;
        match fs::read(&file) {
            Ok(bytes) => Ok(Some(Asset::from_path(path, bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&mut self, path: &str, asset: &Asset) -> Result<(), AssetError> {
        let file = self.resolve(path)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&file, &asset.bytes)?;
        log::debug!("Stored {} ({} bytes) at {}", asset.name, asset.bytes.len(), file.display());
        Ok(())
    }
}

/// MIME type guessed from the file extension.
pub fn mime_type_for(path: &str) -> &'static str {
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("bmp") => "image/bmp",
        _ => "application/octet-stream",
    }
}
