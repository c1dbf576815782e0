//! 模型产物 - 拓扑描述 (model.json) + 有序权重分片 (groupG-shardNofM.bin)

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::core::cards::error::ModelError;
use crate::core::cards::tensor::{DType, Tensor};

pub const DESCRIPTOR_FILE: &str = "model.json";

static SHARD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^group(\d+)-shard(\d+)of(\d+)\.bin$").expect("shard pattern is valid")
});

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub model_topology: Value,
    #[serde(default)]
    pub signature: Option<Value>,
    #[serde(default)]
    pub user_defined_metadata: Option<Value>,
    #[serde(default)]
    pub weights_manifest: Vec<WeightGroup>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeightGroup {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub weights: Vec<WeightSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeightSpec {
    pub name: String,
    #[serde(default)]
    pub shape: Vec<usize>,
    #[serde(default = "default_dtype")]
    pub dtype: String,
}

fn default_dtype() -> String {
    "float32".to_string()
}

impl ModelDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self, ModelError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// 一组候选权重：同一份拓扑 + 按顺序拼接的分片
#[derive(Debug, Clone)]
pub struct ModelCandidate {
    pub name: String,
    pub descriptor: Vec<u8>,
    pub shards: Vec<Vec<u8>>,
}

impl ModelCandidate {
    pub fn new(name: impl Into<String>, descriptor: Vec<u8>, shards: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            descriptor,
            shards,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn is_multi_shard(&self) -> bool {
        self.shards.len() > 1
    }

    pub fn descriptor(&self) -> Result<ModelDescriptor, ModelError> {
        ModelDescriptor::parse(&self.descriptor)
    }

    /// Decodes every manifest entry out of the concatenated shard bytes.
    pub fn decode_weights(&self, descriptor: &ModelDescriptor) -> Result<WeightStore, ModelError> {
        let total: usize = self.shards.iter().map(Vec::len).sum();
        let mut bytes = Vec::with_capacity(total);
        for shard in &self.shards {
            bytes.extend_from_slice(shard);
        }

        let mut offset = 0usize;
        let mut weights = HashMap::new();
        for spec in descriptor.weights_manifest.iter().flat_map(|g| g.weights.iter()) {
            let dtype = DType::parse(&spec.dtype).ok_or_else(|| {
                ModelError::Weights(format!("{}: unsupported dtype {}", spec.name, spec.dtype))
            })?;
            let end = spec
                .shape
                .iter()
                .try_fold(4usize, |acc, &d| acc.checked_mul(d))
                .and_then(|bytes| offset.checked_add(bytes))
                .ok_or_else(|| {
                    ModelError::Weights(format!("{}: shape {:?} is too large", spec.name, spec.shape))
                })?;
            if end > bytes.len() {
                return Err(ModelError::Weights(format!(
                    "{} needs bytes {}..{}, shards hold {}",
                    spec.name,
                    offset,
                    end,
                    bytes.len()
                )));
            }

            let raw = &bytes[offset..end];
            let tensor = match dtype {
                DType::Float32 => Tensor::from_f32(
                    &spec.shape,
                    raw.chunks_exact(4)
                        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                        .collect(),
                )?,
                DType::Int32 => Tensor::from_i32(
                    &spec.shape,
                    raw.chunks_exact(4)
                        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                        .collect(),
                )?,
            };
            weights.insert(spec.name.clone(), tensor);
            offset = end;
        }

        if offset < bytes.len() {
            debug!("{}: {} trailing weight bytes ignored", self.name, bytes.len() - offset);
        }

        Ok(WeightStore { weights })
    }
}

#[derive(Debug, Default)]
pub struct WeightStore {
    weights: HashMap<String, Tensor>,
}

impl WeightStore {
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.weights.get(name)
    }

    /// Looks up `layer/param`, also accepting a scoped name such as
    /// `sequential/layer/param`.
    pub fn param(&self, layer: &str, param: &str) -> Option<&Tensor> {
        let exact = format!("{}/{}", layer, param);
        if let Some(t) = self.weights.get(&exact) {
            return Some(t);
        }
        let suffix = format!("/{}", exact);
        self.weights
            .iter()
            .find(|(name, _)| name.ends_with(&suffix))
            .map(|(_, t)| t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ShardName {
    group: u32,
    index: u32,
    total: u32,
}

fn parse_shard_name(file_name: &str) -> Option<ShardName> {
    let caps = SHARD_RE.captures(file_name)?;
    Some(ShardName {
        group: caps[1].parse().ok()?,
        index: caps[2].parse().ok()?,
        total: caps[3].parse().ok()?,
    })
}

/// 扫描单个模型目录
///
/// The manifest's `paths`, in manifest order across groups, form the primary
/// candidate. Every complete `groupG-shardNofM` family on disk that differs
/// from it is kept as a fallback candidate.
pub fn candidates_in_dir(dir: &Path) -> Result<Vec<ModelCandidate>, ModelError> {
    let descriptor = fs::read(dir.join(DESCRIPTOR_FILE))?;
    let dir_name = dir.display().to_string();
    let mut candidates = Vec::new();

    let listed = match ModelDescriptor::parse(&descriptor) {
        Ok(parsed) => manifest_paths(dir, &parsed),
        Err(e) => {
            warn!("⚠️ {}: unreadable descriptor: {}", dir_name, e);
            None
        }
    };
    if let Some(paths) = &listed {
        candidates.push(ModelCandidate::new(
            format!("{}#manifest", dir_name),
            descriptor.clone(),
            read_shards(paths)?,
        ));
    }

    let mut families: BTreeMap<(u32, u32), Vec<(ShardName, PathBuf)>> = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(shard) = parse_shard_name(file_name) {
            families.entry((shard.group, shard.total)).or_default().push((shard, path));
        }
    }

    for ((group, total), mut shards) in families {
        shards.sort_by_key(|(name, _)| *name);
        if shards.len() != total as usize {
            warn!(
                "⚠️ {}: group {} has {} of {} shard(s), skipped",
                dir_name,
                group,
                shards.len(),
                total
            );
            continue;
        }
        let paths: Vec<PathBuf> = shards.into_iter().map(|(_, path)| path).collect();
        if listed.as_ref() == Some(&paths) {
            continue;
        }
        candidates.push(ModelCandidate::new(
            format!("{}#g{}of{}", dir_name, group, total),
            descriptor.clone(),
            read_shards(&paths)?,
        ));
    }

    if candidates.is_empty() {
        warn!("⚠️ {}: descriptor without weight shards", dir_name);
        candidates.push(ModelCandidate::new(dir_name, descriptor, Vec::new()));
    }
    Ok(candidates)
}

/// Resolves the manifest's shard paths against `dir`. `None` when a path
/// leaves `dir` or names a missing file.
fn manifest_paths(dir: &Path, descriptor: &ModelDescriptor) -> Option<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for relative in descriptor.weights_manifest.iter().flat_map(|g| g.paths.iter()) {
        let relative = Path::new(relative);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            warn!("⚠️ {:?}: manifest path outside model dir", relative);
            return None;
        }
        let path = dir.join(relative);
        if !path.is_file() {
            warn!("⚠️ {:?}: manifest shard missing", path);
            return None;
        }
        paths.push(path);
    }
    Some(paths)
}

fn read_shards(paths: &[PathBuf]) -> Result<Vec<Vec<u8>>, ModelError> {
    Ok(paths.iter().map(fs::read).collect::<Result<Vec<_>, _>>()?)
}

/// Finds model candidates under `root` and its direct subdirectories,
/// ordered multi-shard first, then by name.
pub fn discover_candidates(root: &Path) -> Result<Vec<ModelCandidate>, ModelError> {
    let mut dirs = Vec::new();
    if root.join(DESCRIPTOR_FILE).is_file() {
        dirs.push(root.to_path_buf());
    }
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_dir() && path.join(DESCRIPTOR_FILE).is_file() {
            dirs.push(path);
        }
    }

    let mut candidates = Vec::new();
    for dir in dirs {
        match candidates_in_dir(&dir) {
            Ok(found) => candidates.extend(found),
            Err(e) => warn!("⚠️ Skipping model dir {:?}: {}", dir, e),
        }
    }

    sort_candidates(&mut candidates);
    info!("📦 Discovered {} model candidate(s) under {:?}", candidates.len(), root);
    Ok(candidates)
}

pub fn sort_candidates(candidates: &mut [ModelCandidate]) {
    candidates.sort_by(|a, b| {
        b.is_multi_shard()
            .cmp(&a.is_multi_shard())
            .then_with(|| a.name.cmp(&b.name))
    });
}
