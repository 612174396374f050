//! On-disk layout and model identifier resolution.
//!
//! ```text
//! $HOME/kronk/
//!   libraries/              native engine shared libraries + version.json
//!   models/<org>/<family>/<file>.gguf   (+ sibling mmproj-<file>.gguf)
//!   catalogs/*.yaml  .index.yaml  .catalog_shas.json
//!   keys/*.pem  master.jwt
//! ```
//!
//! A model identifier is the case-insensitive file stem of its .gguf file.
//! The projection file, when present, has the stem `mmproj-<id>`.

use kronk_api::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;

/// The directory layout rooted at the base dir.
#[derive(Debug, Clone)]
pub struct Layout {
    libs_dir: PathBuf,
    models_dir: PathBuf,
    catalogs_dir: PathBuf,
    keys_dir: PathBuf,
}

/// A model located on disk, with its optional projection file.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModel {
    pub id: String,
    pub model_file: PathBuf,
    pub projection_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct LibVersion {
    tag_name: String,
}

impl Default for Layout {
    fn default() -> Self {
        Self::new()
    }
}

impl Layout {
    /// Layout rooted at the configured base directory (env overrides apply).
    pub fn new() -> Self {
        let base = Config::base_dir();
        Self {
            libs_dir: Config::libs_dir(),
            models_dir: Config::models_dir(),
            catalogs_dir: base.join("catalogs"),
            keys_dir: base.join("keys"),
        }
    }

    /// Layout rooted at an explicit directory, for tests and tooling.
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            libs_dir: base.join("libraries"),
            models_dir: base.join("models"),
            catalogs_dir: base.join("catalogs"),
            keys_dir: base.join("keys"),
        }
    }

    pub fn libs_dir(&self) -> &Path {
        &self.libs_dir
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn catalogs_dir(&self) -> &Path {
        &self.catalogs_dir
    }

    pub fn keys_dir(&self) -> &Path {
        &self.keys_dir
    }

    /// The installed native library version from libraries/version.json.
    pub fn library_version(&self) -> Result<String> {
        let path = self.libs_dir.join("version.json");
        let content = fs::read_to_string(&path)
            .map_err(|_| Error::NotFound(format!("no library version at {}", path.display())))?;

        let version: LibVersion = serde_json::from_str(&content)?;
        Ok(version.tag_name)
    }

    /// Resolve a model identifier (case-insensitive file stem) against the
    /// models directory. Returns the model file plus the mmproj sibling when
    /// one exists.
    pub fn resolve_model(&self, id: &str) -> Result<ResolvedModel> {
        if id.is_empty() {
            return Err(Error::invalid("model id is empty"));
        }

        let want = id.to_lowercase();

        for file in walk_gguf(&self.models_dir)? {
            let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            if stem.to_lowercase() != want {
                continue;
            }

            // The projection file sits next to the model file.
            let proj = file.with_file_name(format!("mmproj-{stem}.gguf"));
            let projection_file = proj.exists().then_some(proj);

            return Ok(ResolvedModel {
                id: stem.to_string(),
                model_file: file,
                projection_file,
            });
        }

        Err(Error::NotFound(format!("unknown model: {id}")))
    }

    /// All models on disk, mmproj companions excluded.
    pub fn list_models(&self) -> Result<Vec<ResolvedModel>> {
        let mut models = Vec::new();

        for file in walk_gguf(&self.models_dir)? {
            let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            if stem.starts_with("mmproj-") {
                continue;
            }

            let proj = file.with_file_name(format!("mmproj-{stem}.gguf"));
            let projection_file = proj.exists().then_some(proj);

            models.push(ResolvedModel {
                id: stem.to_string(),
                model_file: file,
                projection_file,
            });
        }

        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }

    /// Remove a model and its projection file from disk.
    pub fn remove_model(&self, id: &str) -> Result<ResolvedModel> {
        let resolved = self.resolve_model(id)?;

        fs::remove_file(&resolved.model_file)?;
        if let Some(proj) = &resolved.projection_file {
            fs::remove_file(proj)?;
        }

        Ok(resolved)
    }
}

fn walk_gguf(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    if !dir.exists() {
        return Ok(files);
    }

    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().map(|e| e == "gguf").unwrap_or(false) {
                files.push(path);
            }
        }
    }

    Ok(files)
}
