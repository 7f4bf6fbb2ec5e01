//! Prompt templates
//!
//! Each model family expects its own chat markup. A [`PromptTemplate`] describes that markup
//! as prefix/suffix pairs per role; the [`PromptLibrary`] holds the built-in templates plus
//! any loaded from JSON files and never fails a lookup.

use crate::storage::StorageError;
use crate::types::{Message, ModelFormat, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

const FALLBACK_TEMPLATE: &str = "mistral";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    pub format: String,
    #[serde(default)]
    pub system_prefix: String,
    #[serde(default)]
    pub system_suffix: String,
    #[serde(default)]
    pub user_prefix: String,
    #[serde(default)]
    pub user_suffix: String,
    #[serde(default)]
    pub assistant_prefix: String,
    #[serde(default)]
    pub assistant_suffix: String,
    #[serde(default)]
    pub default_system_prompt: String,
    #[serde(default)]
    pub stop_tokens: Vec<String>,
}

impl PromptTemplate {
    fn wrap(&self, role: Role) -> (&str, &str) {
        match role {
            Role::System => (self.system_prefix.as_str(), self.system_suffix.as_str()),
            Role::User => (self.user_prefix.as_str(), self.user_suffix.as_str()),
            Role::Assistant => (self.assistant_prefix.as_str(), self.assistant_suffix.as_str()),
        }
    }

    /// Assemble a prompt: system block, history, the user turn, then an open assistant turn
    pub fn format_prompt(&self, user: &str, system: Option<&str>, history: &[Message]) -> String {
        let mut prompt = String::new();

        let system = system
            .filter(|s| !s.is_empty())
            .or_else(|| Some(self.default_system_prompt.as_str()).filter(|s| !s.is_empty()));
        if let Some(system) = system {
            prompt.push_str(&self.system_prefix);
            prompt.push_str(system);
            prompt.push_str(&self.system_suffix);
        }

        for message in history {
            let (prefix, suffix) = self.wrap(message.role);
            prompt.push_str(prefix);
            prompt.push_str(&message.content);
            prompt.push_str(suffix);
        }

        prompt.push_str(&self.user_prefix);
        prompt.push_str(user);
        prompt.push_str(&self.user_suffix);
        prompt.push_str(&self.assistant_prefix);
        prompt
    }

    /// Keep only the assistant's answer from raw engine output
    pub fn extract_response(&self, raw: &str) -> String {
        let end = if self.assistant_suffix.is_empty() {
            None
        } else {
            raw.find(self.assistant_suffix.as_str())
        };
        raw[..end.unwrap_or(raw.len())].trim().to_string()
    }

    /// Stop sequences for a request; an explicit list replaces the template's own
    pub fn stop_tokens_for(&self, explicit: Option<&[String]>) -> Vec<String> {
        match explicit {
            Some(stop) => stop.to_vec(),
            None => self.stop_tokens.clone(),
        }
    }

    /// Write the template as `<dir>/<name>.json`
    pub fn save_to(&self, dir: &Path) -> Result<PathBuf, StorageError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", self.name));
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

fn builtin(
    name: &str,
    format: &str,
    parts: [&str; 6],
    default_system_prompt: &str,
    stop: &str,
) -> PromptTemplate {
    let [system_prefix, system_suffix, user_prefix, user_suffix, assistant_prefix, assistant_suffix] =
        parts;
    PromptTemplate {
        name: name.to_string(),
        format: format.to_string(),
        system_prefix: system_prefix.to_string(),
        system_suffix: system_suffix.to_string(),
        user_prefix: user_prefix.to_string(),
        user_suffix: user_suffix.to_string(),
        assistant_prefix: assistant_prefix.to_string(),
        assistant_suffix: assistant_suffix.to_string(),
        default_system_prompt: default_system_prompt.to_string(),
        stop_tokens: vec![stop.to_string()],
    }
}

pub fn builtin_templates() -> Vec<PromptTemplate> {
    vec![
        builtin(
            "mistral",
            "mistral",
            ["[INST] <<SYS>>\n", "\n<</SYS>>\n\n", "", "\n[/INST]\n", "", "</s>"],
            "You are a helpful, respectful and honest assistant. Answer as helpfully as possible.",
            "</s>",
        ),
        builtin(
            "llama3",
            "llama3",
            [
                "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n",
                "<|eot_id|>",
                "<|start_header_id|>user<|end_header_id|>\n\n",
                "<|eot_id|>",
                "<|start_header_id|>assistant<|end_header_id|>\n\n",
                "<|eot_id|>",
            ],
            "You are a helpful assistant. Give accurate, concise answers.",
            "<|eot_id|>",
        ),
        builtin(
            "tinyllama",
            "tinyllama",
            ["<|system|>\n", "\n", "<|user|>\n", "", "<|assistant|>\n", ""],
            "You are a friendly assistant.",
            "<|assistant|>",
        ),
        builtin(
            "phi4",
            "phi4",
            [
                "<|im_start|>system<|im_sep|>\n",
                "<|im_end|>\n",
                "<|im_start|>user<|im_sep|>\n",
                "<|im_end|>\n",
                "<|im_start|>assistant<|im_sep|>\n",
                "<|im_end|>",
            ],
            "You are a helpful assistant. Think step by step and answer clearly.",
            "<|im_end|>",
        ),
    ]
}

/// Last-resort template used when even the fallback is missing
pub fn minimal_template() -> PromptTemplate {
    builtin(
        "default",
        "default",
        ["", "\n\n", "User: ", "\n", "Assistant: ", "</s>"],
        "You are a helpful assistant.",
        "</s>",
    )
}

pub struct PromptLibrary {
    templates: RwLock<HashMap<String, Arc<PromptTemplate>>>,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptLibrary {
    /// Library holding the built-in templates
    pub fn new() -> Self {
        let templates = builtin_templates()
            .into_iter()
            .map(|t| (t.name.clone(), Arc::new(t)))
            .collect();
        Self {
            templates: RwLock::new(templates),
        }
    }

    /// Add or replace a template
    pub fn add_template(&self, template: PromptTemplate) {
        self.templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(template.name.clone(), Arc::new(template));
    }

    /// Load every `*.json` template in `dir`, returning how many were added
    ///
    /// Unreadable files are skipped with a warning.
    pub fn load_dir(&self, dir: &Path) -> Result<usize, StorageError> {
        let mut loaded = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(StorageError::from)
                .and_then(|json| serde_json::from_str::<PromptTemplate>(&json).map_err(Into::into));
            match parsed {
                Ok(template) => {
                    tracing::debug!("Loaded template {} from {}", template.name, path.display());
                    self.add_template(template);
                    loaded += 1;
                }
                Err(e) => tracing::warn!("Skipping template {}: {}", path.display(), e),
            }
        }
        tracing::info!("Loaded {} template(s) from {}", loaded, dir.display());
        Ok(loaded)
    }

    /// Template by name, falling back to the mistral template and then a minimal default
    pub fn get_template(&self, name: &str) -> Arc<PromptTemplate> {
        let templates = self.templates.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(t) = templates.get(name) {
            return t.clone();
        }
        tracing::debug!("Template {} not found, using {}", name, FALLBACK_TEMPLATE);
        templates
            .get(FALLBACK_TEMPLATE)
            .cloned()
            .unwrap_or_else(|| Arc::new(minimal_template()))
    }

    pub fn template_for_format(&self, format: ModelFormat) -> Arc<PromptTemplate> {
        let name = match format {
            ModelFormat::Mistral | ModelFormat::MistralInstruct | ModelFormat::Mixtral => "mistral",
            other => other.as_str(),
        };
        self.get_template(name)
    }

    pub fn list_templates(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Persist a registered template to `dir`; `None` if no template has that name
    pub fn save_template(&self, name: &str, dir: &Path) -> Result<Option<PathBuf>, StorageError> {
        let template = self
            .templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        match template {
            Some(t) => t.save_to(dir).map(Some),
            None => Ok(None),
        }
    }
}
