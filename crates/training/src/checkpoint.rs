use std::{
    cmp::Ordering,
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{Device, Tensor};
use hex::encode as hex_encode;
use model::Model;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{error::to_runtime_error, optimizer::OptimizerState, TrainingConfig, TrainingError};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const MANIFEST_FILENAME: &str = "manifest.json";
const DIR_PREFIX: &str = "checkpoint-";
const TMP_PREFIX: &str = ".tmp-";
const RETIRED_PREFIX: &str = ".old-";

/// Identity of a persisted checkpoint: the iteration it was taken at and an
/// optional tag such as `bnps`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId {
    pub iteration: u64,
    pub tag: Option<String>,
}

impl CheckpointId {
    pub fn untagged(iteration: u64) -> Self {
        Self {
            iteration,
            tag: None,
        }
    }

    pub fn tagged(iteration: u64, tag: impl Into<String>) -> Self {
        Self {
            iteration,
            tag: Some(tag.into()),
        }
    }

    pub fn directory_name(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{tag}-{DIR_PREFIX}{:08}", self.iteration),
            None => format!("{DIR_PREFIX}{:08}", self.iteration),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        if let Some(digits) = name.strip_prefix(DIR_PREFIX) {
            return parse_iteration(digits).map(Self::untagged);
        }
        let marker = format!("-{DIR_PREFIX}");
        let (tag, digits) = name.split_once(marker.as_str())?;
        if tag.is_empty() || tag.starts_with('.') {
            return None;
        }
        parse_iteration(digits).map(|iteration| Self::tagged(iteration, tag))
    }

    /// Resume preference: higher iteration first, then untagged over tagged.
    fn resume_order(&self, other: &Self) -> Ordering {
        self.iteration
            .cmp(&other.iteration)
            .then_with(|| self.tag.is_none().cmp(&other.tag.is_none()))
    }
}

fn parse_iteration(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Checkpoint to resume from among `ids`: greatest iteration, untagged on ties.
pub fn latest(ids: &[CheckpointId]) -> Option<&CheckpointId> {
    ids.iter().max_by(|a, b| a.resume_order(b))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub iteration: u64,
    pub tag: Option<String>,
    pub config_sha256: String,
    pub model: FileRecord,
    pub optimizer: Option<FileRecord>,
}

impl CheckpointManifest {
    pub fn id(&self) -> CheckpointId {
        CheckpointId {
            iteration: self.iteration,
            tag: self.tag.clone(),
        }
    }
}

/// Everything needed to write one checkpoint.
pub struct CheckpointSnapshot<'a> {
    pub id: CheckpointId,
    pub config: &'a TrainingConfig,
    /// Trainable parameters and normalization running statistics.
    pub tensors: Vec<(String, Tensor)>,
    pub optimizer: Option<OptimizerState>,
}

impl<'a> CheckpointSnapshot<'a> {
    pub fn capture(
        id: CheckpointId,
        config: &'a TrainingConfig,
        model: &Model,
        optimizer: Option<OptimizerState>,
    ) -> Result<Self, TrainingError> {
        let tensors = model
            .state_vars()
            .map_err(to_runtime_error)?
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();
        Ok(Self {
            id,
            config,
            tensors,
            optimizer,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

impl CheckpointDescriptor {
    pub fn id(&self) -> CheckpointId {
        self.manifest.id()
    }
}

#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
    pub tensors: HashMap<String, Tensor>,
    pub optimizer: Option<OptimizerState>,
}

pub trait CheckpointStore: Send {
    fn list(&self) -> Result<Vec<CheckpointId>, TrainingError>;
    fn load(&self, id: &CheckpointId, device: &Device) -> Result<LoadedCheckpoint, TrainingError>;
    fn save(
        &mut self,
        snapshot: &CheckpointSnapshot<'_>,
    ) -> Result<CheckpointDescriptor, TrainingError>;
}

/// One sub-directory per checkpoint under `base_dir`.
#[derive(Debug, Clone)]
pub struct DirectoryCheckpointStore {
    base_dir: PathBuf,
    max_keep: Option<usize>,
}

impl DirectoryCheckpointStore {
    pub fn new(base_dir: impl Into<PathBuf>, max_keep: Option<usize>) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_keep,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn directory_for(&self, id: &CheckpointId) -> PathBuf {
        self.base_dir.join(id.directory_name())
    }

    fn prune(&self) -> Result<(), TrainingError> {
        let Some(limit) = self.max_keep else {
            return Ok(());
        };
        if limit == 0 {
            return Ok(());
        }
        let mut untagged: Vec<_> = self
            .list()?
            .into_iter()
            .filter(|id| id.tag.is_none())
            .collect();
        untagged.sort_by_key(|id| id.iteration);
        let excess = untagged.len().saturating_sub(limit);
        for id in untagged.into_iter().take(excess) {
            let victim = self.directory_for(&id);
            fs::remove_dir_all(&victim).map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to prune checkpoint {}: {err}",
                    victim.display()
                ))
            })?;
            log::debug!("pruned checkpoint {}", victim.display());
        }
        Ok(())
    }
}

impl CheckpointStore for DirectoryCheckpointStore {
    fn list(&self) -> Result<Vec<CheckpointId>, TrainingError> {
        let mut ids = Vec::new();
        if !self.base_dir.exists() {
            return Ok(ids);
        }
        for entry in fs::read_dir(&self.base_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to read checkpoint directory {}: {err}",
                self.base_dir.display()
            ))
        })? {
            let entry = entry.map_err(|err| {
                TrainingError::runtime(format!("failed to read checkpoint entry: {err}"))
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(id) = CheckpointId::parse(&name.to_string_lossy()) {
                ids.push(id);
            }
        }
        ids.sort_by(|a, b| a.resume_order(b));
        Ok(ids)
    }

    fn load(&self, id: &CheckpointId, device: &Device) -> Result<LoadedCheckpoint, TrainingError> {
        let loaded = load_directory(&self.directory_for(id), device)?;
        if loaded.manifest.id() != *id {
            return Err(TrainingError::mismatch(format!(
                "checkpoint {} records iteration {} tag {:?}",
                loaded.directory.display(),
                loaded.manifest.iteration,
                loaded.manifest.tag
            )));
        }
        Ok(loaded)
    }

    fn save(
        &mut self,
        snapshot: &CheckpointSnapshot<'_>,
    ) -> Result<CheckpointDescriptor, TrainingError> {
        if snapshot.tensors.is_empty() {
            return Err(TrainingError::runtime(
                "model contains no tensors to checkpoint",
            ));
        }
        fs::create_dir_all(&self.base_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                self.base_dir.display()
            ))
        })?;

        let dir_name = snapshot.id.directory_name();
        let staging = self.base_dir.join(format!("{TMP_PREFIX}{dir_name}"));
        if staging.exists() {
            remove_dir(&staging)?;
        }
        fs::create_dir(&staging).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                staging.display()
            ))
        })?;

        let model_path = staging.join(MODEL_FILENAME);
        let tensors: HashMap<String, Tensor> = snapshot.tensors.iter().cloned().collect();
        candle_core::safetensors::save(&tensors, &model_path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to serialize model weights to {}: {err}",
                model_path.display()
            ))
        })?;
        let model_record = file_record(&model_path)?;

        let optimizer_record = match &snapshot.optimizer {
            Some(state) => {
                let path = staging.join(OPTIMIZER_FILENAME);
                write_json(&path, state)?;
                Some(file_record(&path)?)
            }
            None => None,
        };

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            iteration: snapshot.id.iteration,
            tag: snapshot.id.tag.clone(),
            config_sha256: fingerprint_config(snapshot.config)?,
            model: model_record,
            optimizer: optimizer_record,
        };
        write_json(&staging.join(MANIFEST_FILENAME), &manifest)?;

        // The previous directory is only deleted once the new one holds its name.
        let directory = self.base_dir.join(&dir_name);
        let retired = if directory.exists() {
            log::warn!("replacing existing checkpoint {}", directory.display());
            let retired = self.base_dir.join(format!("{RETIRED_PREFIX}{dir_name}"));
            if retired.exists() {
                remove_dir(&retired)?;
            }
            rename_dir(&directory, &retired)?;
            Some(retired)
        } else {
            None
        };
        rename_dir(&staging, &directory)?;
        if let Some(retired) = retired {
            remove_dir(&retired)?;
        }

        self.prune()?;

        Ok(CheckpointDescriptor {
            directory,
            manifest,
        })
    }
}

/// Reads and checksum-validates a checkpoint directory.
pub fn load_directory(directory: &Path, device: &Device) -> Result<LoadedCheckpoint, TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model.sha256)?;
    let tensors = candle_core::safetensors::load(&model_path, device).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read model weights {}: {err}",
            model_path.display()
        ))
    })?;

    let optimizer = match manifest.optimizer.as_ref() {
        Some(record) => {
            let path = directory.join(&record.filename);
            validate_file(&path, &record.sha256)?;
            Some(read_json(&path)?)
        }
        None => None,
    };

    Ok(LoadedCheckpoint {
        directory: directory.to_path_buf(),
        manifest,
        tensors,
        optimizer,
    })
}

/// Copies checkpoint tensors into the model. The key set and every shape must
/// match the model's parameters and running statistics exactly.
pub fn apply_model_weights(
    model: &Model,
    tensors: &HashMap<String, Tensor>,
) -> Result<(), TrainingError> {
    let state = model.state_vars().map_err(to_runtime_error)?;

    let mut missing = Vec::new();
    for (name, var) in &state {
        match tensors.get(name) {
            None => missing.push(name.clone()),
            Some(tensor) if tensor.dims() != var.as_tensor().dims() => {
                return Err(TrainingError::mismatch(format!(
                    "shape mismatch for '{name}': model {:?}, checkpoint {:?}",
                    var.as_tensor().dims(),
                    tensor.dims()
                )));
            }
            Some(_) => {}
        }
    }
    if !missing.is_empty() {
        return Err(TrainingError::mismatch(format!(
            "checkpoint missing tensors: {}",
            missing.join(", ")
        )));
    }

    let known: std::collections::HashSet<&str> =
        state.iter().map(|(name, _)| name.as_str()).collect();
    let mut extra: Vec<&str> = tensors
        .keys()
        .map(String::as_str)
        .filter(|name| !known.contains(name))
        .collect();
    if !extra.is_empty() {
        extra.sort_unstable();
        return Err(TrainingError::mismatch(format!(
            "checkpoint contains unknown tensors: {}",
            extra.join(", ")
        )));
    }

    for (name, var) in state {
        let tensor = &tensors[&name];
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor.clone()
        } else {
            tensor.to_dtype(desired_dtype).map_err(to_runtime_error)?
        };
        var.set(&tensor).map_err(to_runtime_error)?;
    }

    Ok(())
}

pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn rename_dir(from: &Path, to: &Path) -> Result<(), TrainingError> {
    fs::rename(from, to).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to move {} to {}: {err}",
            from.display(),
            to.display()
        ))
    })
}

fn remove_dir(path: &Path) -> Result<(), TrainingError> {
    fs::remove_dir_all(path).map_err(|err| {
        TrainingError::runtime(format!("failed to remove {}: {err}", path.display()))
    })
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::mismatch(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all())
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_names_round_trip() {
        let plain = CheckpointId::untagged(42);
        assert_eq!(plain.directory_name(), "checkpoint-00000042");
        assert_eq!(CheckpointId::parse("checkpoint-00000042"), Some(plain));

        let tagged = CheckpointId::tagged(10_000, "bnps");
        assert_eq!(tagged.directory_name(), "bnps-checkpoint-00010000");
        assert_eq!(CheckpointId::parse("bnps-checkpoint-00010000"), Some(tagged));

        assert_eq!(CheckpointId::parse(".tmp-checkpoint-00000001"), None);
        assert_eq!(CheckpointId::parse(".old-bnps-checkpoint-00000001"), None);
        assert_eq!(CheckpointId::parse("checkpoint-"), None);
        assert_eq!(CheckpointId::parse("notes.txt"), None);
    }

    fn tiny_snapshot<'a>(
        config: &'a TrainingConfig,
        id: CheckpointId,
        value: f32,
    ) -> Result<CheckpointSnapshot<'a>, TrainingError> {
        let weight = Tensor::full(value, (2, 2), &Device::Cpu).map_err(to_runtime_error)?;
        Ok(CheckpointSnapshot {
            id,
            config,
            tensors: vec![("classifier.weight".to_string(), weight)],
            optimizer: None,
        })
    }

    #[test]
    fn saving_an_existing_id_swaps_in_the_new_directory() -> Result<(), TrainingError> {
        let root = tempfile::tempdir()?;
        let config: TrainingConfig = toml::from_str(
            "[data]\ntrain = \"train.safetensors\"\nvalidation = \"val.safetensors\"\n",
        )?;
        let mut store = DirectoryCheckpointStore::new(root.path(), None);
        let id = CheckpointId::untagged(2);

        store.save(&tiny_snapshot(&config, id.clone(), 1.0)?)?;
        let replaced = store.save(&tiny_snapshot(&config, id.clone(), 3.0)?)?;
        assert_eq!(replaced.directory, store.directory_for(&id));

        let mut entries: Vec<String> = fs::read_dir(root.path())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        entries.sort();
        assert_eq!(entries, vec!["checkpoint-00000002".to_string()]);

        let loaded = store.load(&id, &Device::Cpu)?;
        let weight = loaded
            .tensors
            .get("classifier.weight")
            .ok_or_else(|| TrainingError::runtime("weight missing"))?
            .flatten_all()
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(to_runtime_error)?;
        assert_eq!(weight, vec![3.0; 4]);
        Ok(())
    }

    #[test]
    fn latest_prefers_highest_then_untagged() {
        let ids = vec![
            CheckpointId::untagged(200),
            CheckpointId::tagged(400, "bnps"),
            CheckpointId::untagged(400),
            CheckpointId::untagged(300),
        ];
        assert_eq!(latest(&ids), Some(&CheckpointId::untagged(400)));

        let ids = vec![CheckpointId::untagged(200), CheckpointId::tagged(400, "bnps")];
        assert_eq!(latest(&ids), Some(&CheckpointId::tagged(400, "bnps")));
        assert_eq!(latest(&[]), None);
    }
}
