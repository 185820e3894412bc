// Pretrained model acquisition
// Resolves model identifiers, downloads checkpoint files into a local cache, and loads them.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::StatusCode;

use crate::core::weights::WeightStore;
use crate::models::export::{ExportError, ExportResult};
use crate::models::vitpose::VitPoseConfig;

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Files a checkpoint directory must contain
pub const REQUIRED_FILES: [&str; 2] = [CONFIG_FILE, WEIGHTS_FILE];

/// Whole-transfer limit. Checkpoints run to several hundred megabytes.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocking client for hub downloads
fn http_client() -> ExportResult<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| ExportError::Download(e.to_string()))
}

// ==============================================================================
// Model Handle
// ==============================================================================

/// A fully loaded checkpoint: configuration plus every tensor the forward pass needs
#[derive(Debug, Clone)]
pub struct PoseModel {
    pub id: String,
    pub config: VitPoseConfig,
    pub weights: WeightStore,
}

impl PoseModel {
    /// Assemble a model, rejecting weight sets that do not cover the configuration
    pub fn new(id: impl Into<String>, config: VitPoseConfig, weights: WeightStore) -> ExportResult<Self> {
        config.validate()?;
        weights.check_layout(&config)?;
        Ok(Self {
            id: id.into(),
            config,
            weights,
        })
    }

    /// Randomly initialised model with the given architecture
    pub fn random(config: VitPoseConfig, seed: Option<u64>) -> ExportResult<Self> {
        let weights = WeightStore::random(&config, seed);
        Self::new("random-init", config, weights)
    }
}

// ==============================================================================
// Model Source
// ==============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    /// Hugging Face model hub repository
    HuggingFace { repo: String, revision: String },
    /// Directory holding `config.json` and `model.safetensors`
    LocalDir(PathBuf),
}

impl ModelSource {
    /// Turn a user-supplied identifier into a source without touching the network
    pub fn resolve(model_id: &str, revision: &str) -> ExportResult<Self> {
        let path = Path::new(model_id);
        if path.is_dir() {
            return Ok(ModelSource::LocalDir(path.to_path_buf()));
        }
        validate_model_id(model_id)?;
        validate_revision(model_id, revision)?;
        Ok(ModelSource::HuggingFace {
            repo: model_id.to_string(),
            revision: revision.to_string(),
        })
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Hub identifiers look like `owner/name`
pub fn validate_model_id(model_id: &str) -> ExportResult<()> {
    let not_found = |reason: &str| {
        Err(ExportError::ModelNotFound {
            model_id: model_id.to_string(),
            reason: reason.to_string(),
        })
    };

    let mut parts = model_id.split('/');
    let (owner, name) = match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) => (owner, name),
        _ => return not_found("identifier must have the form owner/name"),
    };
    for part in [owner, name] {
        if part.is_empty() || part == "." || part == ".." {
            return not_found("identifier has an empty owner or name");
        }
        if !part.chars().all(is_name_char) {
            return not_found("identifier contains characters outside [A-Za-z0-9._-]");
        }
    }
    Ok(())
}

fn validate_revision(model_id: &str, revision: &str) -> ExportResult<()> {
    let valid = !revision.is_empty()
        && revision.split('/').all(|p| !p.is_empty() && p != "..")
        && revision.chars().all(|c| is_name_char(c) || c == '/');
    if valid {
        Ok(())
    } else {
        Err(ExportError::ModelNotFound {
            model_id: model_id.to_string(),
            reason: format!("invalid revision '{}'", revision),
        })
    }
}

// ==============================================================================
// Model Manager
// ==============================================================================

/// Caches hub downloads under `<cache_dir>/<owner>--<name>/<revision>/`
pub struct ModelManager {
    cache_dir: PathBuf,
    endpoint: String,
    auth_token: Option<String>,
}

impl ModelManager {
    /// Create a new model manager with cache directory
    pub fn new(cache_dir: PathBuf) -> ExportResult<Self> {
        fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            auth_token: None,
        })
    }

    /// Bearer token sent with hub requests (gated or private repositories)
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Get the cache directory path
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Local directory holding one revision of a repository
    pub fn revision_dir(&self, repo: &str, revision: &str) -> PathBuf {
        self.cache_dir
            .join(repo.replace('/', "--"))
            .join(revision.replace('/', "--"))
    }

    /// Get the local path for a repository file
    pub fn get_model_path(&self, repo: &str, revision: &str, file: &str) -> PathBuf {
        self.revision_dir(repo, revision).join(file)
    }

    /// Check if every required file of a revision is cached
    pub fn is_cached(&self, repo: &str, revision: &str) -> bool {
        REQUIRED_FILES
            .iter()
            .all(|file| self.get_model_path(repo, revision, file).is_file())
    }

    /// Download a repository file if not cached
    pub fn ensure_file(&self, repo: &str, revision: &str, file: &str) -> ExportResult<PathBuf> {
        let path = self.get_model_path(repo, revision, file);
        if path.is_file() {
            tracing::debug!("{} already cached at {}", file, path.display());
            return Ok(path);
        }

        let url = format!("{}/{}/resolve/{}/{}", self.endpoint, repo, revision, file);
        tracing::info!("Downloading {}", url);

        let mut request = http_client()?.get(&url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let mut response = request
            .send()
            .map_err(|e| ExportError::Download(format!("{}: {}", url, e)))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                return Err(ExportError::ModelNotFound {
                    model_id: repo.to_string(),
                    reason: format!("hub returned {} for {}", response.status(), file),
                });
            }
            status => {
                return Err(ExportError::Download(format!("{}: HTTP {}", url, status)));
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial = path.with_extension(partial_extension(&path));
        let mut out = fs::File::create(&partial)?;
        let written = response
            .copy_to(&mut out)
            .map_err(|e| ExportError::Download(format!("{}: {}", url, e)))?;
        out.flush()?;
        drop(out);
        fs::rename(&partial, &path)?;

        tracing::info!("Saved {} ({} bytes) to {}", file, written, path.display());
        Ok(path)
    }

    /// Resolve, fetch and load a checkpoint
    pub fn acquire(&self, model_id: &str, revision: &str) -> ExportResult<PoseModel> {
        let result = self.acquire_inner(model_id, revision);
        if let Err(e) = &result {
            if e.is_not_found() {
                tracing::error!("Could not load {}: {}", model_id, e);
            }
        }
        result
    }

    fn acquire_inner(&self, model_id: &str, revision: &str) -> ExportResult<PoseModel> {
        let dir = match ModelSource::resolve(model_id, revision)? {
            ModelSource::LocalDir(dir) => {
                for file in REQUIRED_FILES {
                    if !dir.join(file).is_file() {
                        return Err(ExportError::ModelNotFound {
                            model_id: model_id.to_string(),
                            reason: format!("{} missing from {}", file, dir.display()),
                        });
                    }
                }
                dir
            }
            ModelSource::HuggingFace { repo, revision } => {
                for file in REQUIRED_FILES {
                    self.ensure_file(&repo, &revision, file)?;
                }
                self.revision_dir(&repo, &revision)
            }
        };

        let contents = fs::read_to_string(dir.join(CONFIG_FILE))?;
        let config = VitPoseConfig::from_json(&contents)?;
        let weights = WeightStore::load(&dir.join(WEIGHTS_FILE))?;
        let model = PoseModel::new(model_id, config, weights)?;

        tracing::info!(
            "Loaded {} ({} layers, hidden size {}, {} parameters)",
            model_id,
            model.config.backbone_config.num_hidden_layers,
            model.config.backbone_config.hidden_size,
            model.weights.parameter_count()
        );
        Ok(model)
    }

    /// Clear the model cache
    pub fn clear_cache(&self) -> ExportResult<()> {
        if self.cache_dir.exists() {
            fs::remove_dir_all(&self.cache_dir)?;
            fs::create_dir_all(&self.cache_dir)?;
        }
        Ok(())
    }

    /// Get cache size in bytes
    pub fn cache_size(&self) -> ExportResult<u64> {
        dir_size(&self.cache_dir)
    }
}

fn partial_extension(path: &Path) -> String {
    match path.extension() {
        Some(ext) => format!("{}.part", ext.to_string_lossy()),
        None => "part".to_string(),
    }
}

fn dir_size(dir: &Path) -> ExportResult<u64> {
    let mut total_size = 0u64;
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                total_size += dir_size(&entry.path())?;
            } else if metadata.is_file() {
                total_size += metadata.len();
            }
        }
    }
    Ok(total_size)
}
