//! Model registry
//!
//! Discovers model files under a directory and infers their metadata from naming
//! conventions. Classification is ordered substring matching on the lower-cased file name;
//! the first rule that matches wins and nothing here ever fails on an odd name.

use crate::types::{ModelDescriptor, ModelFormat};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// File extensions treated as model weights
pub const MODEL_EXTENSIONS: [&str; 3] = ["gguf", "bin", "ggml"];

/// Files smaller than this are rejected by [`ModelRegistry::validate_compatibility`]
pub const MIN_MODEL_SIZE: u64 = 1024 * 1024;

pub const DEFAULT_CONTEXT_LENGTH: u32 = 4096;

const QUANTIZATIONS: [&str; 7] = ["q4_0", "q4_k_m", "q5_k_m", "q5_0", "q6_k", "q8_0", "f16"];

// "13b" must be tried before "3b", and "1.1b" before "1b".
const PARAMETER_SIZES: [&str; 7] = ["1.1b", "13b", "70b", "1b", "3b", "7b", "8b"];

/// Result of resolving a path or identifier
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Arc<ModelDescriptor>),
    /// The file exists but does not have a model extension
    Unrecognized(PathBuf),
    NotFound,
}

impl Lookup {
    pub fn found(self) -> Option<Arc<ModelDescriptor>> {
        match self {
            Lookup::Found(d) => Some(d),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Compatibility {
    pub compatible: bool,
    pub reason: String,
}

impl Compatibility {
    fn ok() -> Self {
        Self {
            compatible: true,
            reason: "Model is compatible".to_string(),
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            compatible: false,
            reason: reason.into(),
        }
    }
}

pub fn infer_format(file_name: &str) -> ModelFormat {
    let name = file_name.to_lowercase();
    let has = |s: &str| name.contains(s);

    if has("mistral") {
        if has("instruct") {
            ModelFormat::MistralInstruct
        } else {
            ModelFormat::Mistral
        }
    } else if has("llama-3") || has("llama3") {
        ModelFormat::Llama3
    } else if has("llama-2") || has("llama2") {
        ModelFormat::Llama2
    } else if has("tinyllama") {
        ModelFormat::Tinyllama
    } else if has("phi-4") || has("phi4") {
        ModelFormat::Phi4
    } else if has("phi-3") || has("phi3") {
        ModelFormat::Phi3
    } else if has("phi-2") || has("phi2") {
        ModelFormat::Phi2
    } else if has("phi-") {
        ModelFormat::Phi
    } else if has("mixtral") {
        ModelFormat::Mixtral
    } else {
        ModelFormat::Uncategorized
    }
}

pub fn infer_quantization(file_name: &str) -> String {
    let name = file_name.to_lowercase();
    QUANTIZATIONS
        .iter()
        .find(|q| name.contains(*q))
        .map(|q| q.to_uppercase())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn infer_parameter_size(file_name: &str) -> String {
    let name = file_name.to_lowercase();
    PARAMETER_SIZES
        .iter()
        .find(|p| name.contains(*p))
        .map(|p| p.to_uppercase())
        .unwrap_or_else(|| "unknown".to_string())
}

fn has_model_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| MODEL_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Build a descriptor for an existing file
fn classify(path: &Path) -> Option<ModelDescriptor> {
    let metadata = fs::metadata(path).ok()?;
    if !metadata.is_file() {
        return None;
    }
    let id = path.file_name()?.to_string_lossy().to_string();
    let name = id.split('.').next().unwrap_or(&id).to_string();
    let last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);

    Some(ModelDescriptor {
        format: infer_format(&id),
        quantization: infer_quantization(&id),
        parameter_size: infer_parameter_size(&id),
        id,
        name,
        path: path.to_path_buf(),
        context_length: DEFAULT_CONTEXT_LENGTH,
        size_bytes: metadata.len(),
        last_modified,
        supported_features: vec!["text-generation".to_string()],
    })
}

/// Catalogue of model files available on disk
pub struct ModelRegistry {
    models_dir: PathBuf,
    models: RwLock<HashMap<PathBuf, Arc<ModelDescriptor>>>,
    default_model: RwLock<Option<String>>,
}

impl ModelRegistry {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            models: RwLock::new(HashMap::new()),
            default_model: RwLock::new(None),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    fn resolve_path(&self, path_or_id: &str) -> PathBuf {
        let path = Path::new(path_or_id);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.models_dir.join(path)
        }
    }

    /// Walk the models directory and replace the catalogue with what is found
    pub fn scan(&self) -> HashMap<PathBuf, Arc<ModelDescriptor>> {
        let mut found = HashMap::new();

        if !self.models_dir.is_dir() {
            tracing::warn!(
                "Models directory {} does not exist",
                self.models_dir.display()
            );
        } else {
            let pattern = format!(
                "{}/**/*",
                glob::Pattern::escape(&self.models_dir.to_string_lossy())
            );
            match glob::glob(&pattern) {
                Ok(paths) => {
                    for entry in paths {
                        match entry {
                            Ok(path) if has_model_extension(&path) => {
                                if let Some(descriptor) = classify(&path) {
                                    found.insert(path, Arc::new(descriptor));
                                }
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!("Skipping unreadable entry: {}", e),
                        }
                    }
                }
                Err(e) => tracing::warn!("Invalid scan pattern {}: {}", pattern, e),
            }
        }

        tracing::info!(
            "Found {} model(s) in {}",
            found.len(),
            self.models_dir.display()
        );
        *self.models.write().unwrap_or_else(PoisonError::into_inner) = found.clone();
        found
    }

    /// Resolve a path (absolute, or relative to the models directory)
    ///
    /// Unseen files with a model extension are classified and remembered.
    pub fn lookup(&self, path_or_id: &str) -> Lookup {
        let path = self.resolve_path(path_or_id);

        if let Some(d) = self
            .models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&path)
        {
            return Lookup::Found(d.clone());
        }

        if !path.is_file() {
            return Lookup::NotFound;
        }
        if !has_model_extension(&path) {
            return Lookup::Unrecognized(path);
        }

        match classify(&path) {
            Some(descriptor) => {
                let descriptor = Arc::new(descriptor);
                self.models
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(path, descriptor.clone());
                Lookup::Found(descriptor)
            }
            None => Lookup::NotFound,
        }
    }

    /// Find a catalogued model by file name or display name
    pub fn find_by_name(&self, name: &str) -> Option<Arc<ModelDescriptor>> {
        self.list_available()
            .into_iter()
            .find(|d| d.id == name || d.name == name)
    }

    /// All catalogued models, ordered by identifier
    pub fn list_available(&self) -> Vec<Arc<ModelDescriptor>> {
        let mut models: Vec<_> = self
            .models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.path.cmp(&b.path)));
        models
    }

    pub fn validate_compatibility(&self, path: &Path) -> Compatibility {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.models_dir.join(path)
        };

        let metadata = match fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            _ => return Compatibility::rejected(format!("Model file not found: {}", path.display())),
        };
        if !has_model_extension(&path) {
            return Compatibility::rejected(format!(
                "Unsupported model format. Supported formats: {}",
                MODEL_EXTENSIONS.join(", ")
            ));
        }
        if metadata.len() < MIN_MODEL_SIZE {
            return Compatibility::rejected(format!(
                "Model file too small ({} bytes), may be corrupted",
                metadata.len()
            ));
        }
        Compatibility::ok()
    }

    /// Identifier configured as the default model
    pub fn default_model_id(&self) -> Option<String> {
        self.default_model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Descriptor of the default model, if it resolves
    pub fn default_model(&self) -> Option<Arc<ModelDescriptor>> {
        let id = self.default_model_id()?;
        self.lookup(&id).found().or_else(|| self.find_by_name(&id))
    }

    pub fn set_default_model(&self, id: Option<String>) {
        if let Some(id) = &id {
            tracing::info!("Default model set to {}", id);
        }
        *self
            .default_model
            .write()
            .unwrap_or_else(PoisonError::into_inner) = id;
    }

    /// Whether `id` names the configured default model
    pub fn is_default(&self, id: &str) -> bool {
        match self.default_model_id() {
            Some(default) => {
                if default == id {
                    return true;
                }
                self.default_model()
                    .map(|d| d.id == id || d.name == id || d.path == self.resolve_path(id))
                    .unwrap_or(false)
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str, size: usize) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, vec![0u8; size]).unwrap();
        path
    }

    #[test]
    fn test_classification_of_mistral_instruct() {
        let name = "mistral-7b-instruct.Q4_K_M.gguf";
        assert_eq!(infer_format(name), ModelFormat::MistralInstruct);
        assert_eq!(infer_parameter_size(name), "7B");
        assert_eq!(infer_quantization(name), "Q4_K_M");
    }

    #[test]
    fn test_classification_rule_order() {
        assert_eq!(infer_format("Meta-Llama-3-8B.gguf"), ModelFormat::Llama3);
        assert_eq!(infer_format("llama-2-13b-chat.gguf"), ModelFormat::Llama2);
        assert_eq!(infer_format("tinyllama-1.1b-chat.gguf"), ModelFormat::Tinyllama);
        assert_eq!(infer_format("phi-4-q4.gguf"), ModelFormat::Phi4);
        assert_eq!(infer_format("phi-2.Q8_0.gguf"), ModelFormat::Phi2);
        assert_eq!(infer_format("phi-1_5.gguf"), ModelFormat::Phi);
        assert_eq!(infer_format("mixtral-8x7b.gguf"), ModelFormat::Mixtral);
        assert_eq!(infer_format("mistral-7b.gguf"), ModelFormat::Mistral);
        assert_eq!(infer_format("gpt2.bin"), ModelFormat::Uncategorized);

        assert_eq!(infer_parameter_size("llama-2-13b-chat.gguf"), "13B");
        assert_eq!(infer_parameter_size("tinyllama-1.1b-chat.gguf"), "1.1B");
        assert_eq!(infer_parameter_size("model.gguf"), "unknown");
        assert_eq!(infer_quantization("model.gguf"), "unknown");
        assert_eq!(infer_quantization("phi-2.Q8_0.gguf"), "Q8_0");
    }

    #[test]
    fn test_scan_filters_extensions_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "mistral-7b-instruct.Q4_K_M.gguf", 16);
        touch(dir.path(), "nested/phi-2.bin", 16);
        touch(dir.path(), "README.md", 16);

        let registry = ModelRegistry::new(dir.path());
        let found = registry.scan();
        assert_eq!(found.len(), 2);

        let d = registry.find_by_name("mistral-7b-instruct").unwrap();
        assert_eq!(d.id, "mistral-7b-instruct.Q4_K_M.gguf");
        assert_eq!(d.context_length, 4096);
        assert_eq!(d.supported_features, vec!["text-generation".to_string()]);

        fs::remove_file(dir.path().join("nested/phi-2.bin")).unwrap();
        assert_eq!(registry.scan().len(), 1);
        assert_eq!(registry.list_available().len(), 1);
    }

    #[test]
    fn test_scan_missing_directory() {
        let registry = ModelRegistry::new("/definitely/not/here");
        assert!(registry.scan().is_empty());
    }

    #[test]
    fn test_lookup_variants() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path());

        assert_eq!(registry.lookup("missing.gguf"), Lookup::NotFound);

        touch(dir.path(), "notes.txt", 16);
        assert!(matches!(registry.lookup("notes.txt"), Lookup::Unrecognized(_)));

        // Files added after the last scan are classified on first lookup
        let path = touch(dir.path(), "llama3-8b.Q5_K_M.gguf", 16);
        let d = registry.lookup(path.to_str().unwrap()).found().unwrap();
        assert_eq!(d.format, ModelFormat::Llama3);
        assert_eq!(registry.list_available().len(), 1);
    }

    #[test]
    fn test_validate_compatibility() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path());

        let missing = registry.validate_compatibility(Path::new("nope.gguf"));
        assert!(!missing.compatible);
        assert!(missing.reason.contains("not found"));

        touch(dir.path(), "weights.txt", MIN_MODEL_SIZE as usize);
        let wrong_ext = registry.validate_compatibility(Path::new("weights.txt"));
        assert!(!wrong_ext.compatible);
        assert!(wrong_ext.reason.contains("Unsupported"));

        touch(dir.path(), "tiny.gguf", 10);
        let small = registry.validate_compatibility(Path::new("tiny.gguf"));
        assert!(!small.compatible);
        assert!(small.reason.contains("too small"));

        touch(dir.path(), "ok.gguf", MIN_MODEL_SIZE as usize);
        assert!(registry.validate_compatibility(Path::new("ok.gguf")).compatible);
    }

    #[test]
    fn test_default_model() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "phi-2.Q4_0.gguf", 16);
        let registry = ModelRegistry::new(dir.path());
        registry.scan();

        assert!(registry.default_model().is_none());
        registry.set_default_model(Some("phi-2".to_string()));
        assert_eq!(registry.default_model().unwrap().id, "phi-2.Q4_0.gguf");
        assert!(registry.is_default("phi-2"));
        assert!(registry.is_default("phi-2.Q4_0.gguf"));
        assert!(!registry.is_default("mistral"));
    }
}
