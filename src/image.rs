//! Read-only view of the local image store.
//!
//! Layout under `{root}/images`:
//! - `images.json`: `{"<name>": {"<tag>": "<digest>"}}`
//! - `<digest>/manifest.json`: docker-save style manifest list
//! - `<digest>/<digest>.json`: image configuration
//! - `<digest>/<layer[..12]>/fs`: extracted layer contents

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::ImageError;

const DEFAULT_TAG: &str = "latest";
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9][a-z0-9._/-]*)(?::([A-Za-z0-9_][A-Za-z0-9_.-]*))?$")
        .expect("image reference pattern is valid")
});

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "Layers", default)]
    pub layers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageConfig {
    #[serde(default)]
    config: ContainerConfig,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Env", default)]
    env: Option<Vec<String>>,
}

pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ImageStore { dir: dir.into() }
    }

    /// Turns `name[:tag]` (or a digest already in the store) into a digest.
    /// Images are never fetched; a reference missing locally is an error.
    pub fn resolve(&self, reference: &str) -> Result<String, ImageError> {
        if !reference.is_empty() && !reference.contains('/') && self.dir.join(reference).is_dir() {
            return Ok(reference.to_string());
        }

        let parts = REFERENCE
            .captures(reference)
            .ok_or_else(|| ImageError::InvalidReference(reference.to_string()))?;
        let name = &parts[1];
        let tag = parts.get(2).map_or(DEFAULT_TAG, |m| m.as_str());

        let index_path = self.dir.join("images.json");
        if !index_path.exists() {
            return Err(ImageError::NotFound(reference.to_string()));
        }
        let index: HashMap<String, HashMap<String, String>> = read_json(&index_path)?;

        index
            .get(name)
            .and_then(|tags| tags.get(tag))
            .cloned()
            .ok_or_else(|| ImageError::NotFound(format!("{}:{}", name, tag)))
    }

    pub fn manifest(&self, digest: &str) -> Result<Vec<ManifestEntry>, ImageError> {
        read_json(&self.dir.join(digest).join("manifest.json"))
    }

    /// Directory holding the extracted contents of `layer`.
    pub fn layer_path(&self, digest: &str, layer: &str) -> Result<PathBuf, ImageError> {
        let short = layer
            .get(..12)
            .ok_or_else(|| ImageError::BadLayer(layer.to_string()))?;
        Ok(self.dir.join(digest).join(short).join("fs"))
    }

    /// Environment declared by the image, with a default `PATH` when the
    /// image does not set one.
    pub fn environment(&self, digest: &str) -> Result<Vec<(String, String)>, ImageError> {
        let path = self.dir.join(digest).join(format!("{}.json", digest));
        let config: ImageConfig = if path.exists() {
            read_json(&path)?
        } else {
            ImageConfig::default()
        };

        let mut env: Vec<(String, String)> = config
            .config
            .env
            .unwrap_or_default()
            .iter()
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if !env.iter().any(|(k, _)| k == "PATH") {
            env.push(("PATH".to_string(), DEFAULT_PATH.to_string()));
        }
        Ok(env)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ImageError> {
    let data = std::fs::read(path).map_err(|source| ImageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&data).map_err(|source| ImageError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
