//! Resolves file requests to concrete paths
//!
//! Peers never name paths directly. A request carries a category and a
//! selector; the catalog turns that into a path on disk or nothing at all.
//! Submarine and mod lookups go through an index built by scanning the
//! content directories at startup and hashing each file, so a request is
//! only satisfied when both the name and the content hash match what the
//! server actually has. Unresolvable requests stay unanswered on the wire.

use log::{debug, info};
use shared::{FileCategory, FileSelector};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct CatalogEntry {
    path: PathBuf,
    hash: String,
}

/// Index of the files the server is willing to distribute.
#[derive(Debug, Default)]
pub struct FileCatalog {
    entries: HashMap<(FileCategory, String), CatalogEntry>,
    campaign_save: Option<PathBuf>,
}

impl FileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans a directory and indexes every file carrying the category's
    /// extension under its stem name. Files are hashed so lookups can pin
    /// an exact version.
    pub fn scan_directory(&mut self, category: FileCategory, dir: &Path) -> io::Result<usize> {
        let mut indexed = 0;

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(category.extension()) {
                continue;
            }

            let stem = name
                .strip_suffix(category.extension())
                .unwrap_or(name)
                .to_string();
            let bytes = std::fs::read(&path)?;
            let hash = blake3::hash(&bytes).to_hex().to_string();

            debug!("indexed {:?} {} ({})", category, stem, hash);
            self.entries
                .insert((category, stem), CatalogEntry { path, hash });
            indexed += 1;
        }

        info!(
            "indexed {} {:?} file(s) from {}",
            indexed,
            category,
            dir.display()
        );
        Ok(indexed)
    }

    /// Points the CampaignSave category at the current save file.
    pub fn set_campaign_save(&mut self, path: Option<PathBuf>) {
        self.campaign_save = path;
    }

    pub fn campaign_save(&self) -> Option<&Path> {
        self.campaign_save.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The hash an indexed file was advertised under, if any.
    pub fn hash_of(&self, category: FileCategory, name: &str) -> Option<&str> {
        self.entries
            .get(&(category, name.to_string()))
            .map(|e| e.hash.as_str())
    }

    /// Maps a request to a path, or `None` when the selector doesn't match
    /// anything the server offers. A `None` here is silently dropped at the
    /// protocol boundary; only the host log sees it.
    pub fn resolve(&self, category: FileCategory, selector: &FileSelector) -> Option<PathBuf> {
        match (category, selector) {
            (FileCategory::CampaignSave, FileSelector::Current) => self.campaign_save.clone(),
            (FileCategory::CampaignSave, FileSelector::Named { .. }) => None,
            (_, FileSelector::Named { name, hash }) => {
                let entry = self.entries.get(&(category, name.clone()))?;
                if entry.hash != *hash {
                    debug!(
                        "hash mismatch for {:?} {}: requested {}, have {}",
                        category, name, hash, entry.hash
                    );
                    return None;
                }
                Some(entry.path.clone())
            }
            (_, FileSelector::Current) => None,
        }
    }
}
