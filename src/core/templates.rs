//! # Template Registry (C4)
//!
//! Charge et valide des templates de prompt nommés et versionnés depuis un
//! fichier structuré au démarrage. Le rendu substitue les `{{var}}` et
//! refuse toute sélection de template par un nom libre non présent dans
//! l'allowlist serveur (durcissement anti prompt-injection, §4.4).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{PipelineError, Result};
use crate::models::{ExpectedOutput, PromptTemplate, SafetyLevel};

const MAX_VARIABLE_LEN: usize = 8 * 1024;

/// Forme brute d'un template tel que chargé depuis le fichier TOML.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TemplateFileEntry {
    pub name: String,
    pub version: u32,
    pub safety_level: SafetyLevel,
    pub expected_output: ExpectedOutput,
    pub body: String,
    pub declared_variables: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TemplateFile {
    #[serde(default)]
    pub templates: Vec<TemplateFileEntry>,
}

fn default_templates() -> Vec<TemplateFileEntry> {
    vec![TemplateFileEntry {
        name: "moderation_prompt".to_string(),
        version: 1,
        safety_level: SafetyLevel::Medium,
        expected_output: ExpectedOutput::Json,
        body: concat!(
            "You are a content moderation oracle. Respond with JSON only, with keys ",
            "decision (one of Toxic, Non-Toxic, Spam, PII, Harassment), confidence ",
            "(a number from 0 to 1) and reasoning (a short string).\n",
            "channel: {{channel_id}}\nuser: {{user_id}}\nmessage: {{chat_message}}\n",
            "history: {{history_summary}}",
        )
        .to_string(),
        declared_variables: vec![
            "chat_message".to_string(),
            "channel_id".to_string(),
            "user_id".to_string(),
            "history_summary".to_string(),
        ],
    }]
}

/// Registre de templates, process-wide partagé et immuable après enregistrement.
pub struct TemplateRegistry {
    templates: RwLock<Arc<HashMap<String, PromptTemplate>>>,
}

impl TemplateRegistry {
    /// Construit le registre avec le jeu de templates par défaut (un seul
    /// template allowlisté : `moderation_prompt`).
    pub fn with_defaults() -> Result<Self> {
        Self::from_entries(default_templates())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::configuration_error(format!(
                "cannot read template_file {}: {e}",
                path.display()
            ))
        })?;
        let file: TemplateFile = toml::from_str(&content)
            .map_err(|e| PipelineError::configuration_error(format!("invalid template_file: {e}")))?;
        Self::from_entries(file.templates)
    }

    fn from_entries(entries: Vec<TemplateFileEntry>) -> Result<Self> {
        let mut map = HashMap::new();
        for entry in entries {
            let template = Self::validate_entry(entry)?;
            map.insert(template.name.clone(), template);
        }
        Ok(Self {
            templates: RwLock::new(Arc::new(map)),
        })
    }

    fn validate_entry(entry: TemplateFileEntry) -> Result<PromptTemplate> {
        let declared: HashSet<String> = entry.declared_variables.into_iter().collect();

        for placeholder in extract_placeholders(&entry.body) {
            if !declared.contains(&placeholder) {
                return Err(PipelineError::TemplateInvalid {
                    name: entry.name.clone(),
                    reason: format!("placeholder {{{{{placeholder}}}}} not in declared_variables"),
                });
            }
        }

        let required_marker = match entry.expected_output {
            ExpectedOutput::Json => "JSON",
            ExpectedOutput::Text => "",
        };
        if !required_marker.is_empty() && !entry.body.contains(required_marker) {
            return Err(PipelineError::TemplateInvalid {
                name: entry.name.clone(),
                reason: "body lacks required output-format instruction".to_string(),
            });
        }

        Ok(PromptTemplate {
            name: entry.name,
            version: entry.version,
            safety_level: entry.safety_level,
            expected_output: entry.expected_output,
            body: entry.body,
            declared_variables: declared,
        })
    }

    /// Remplace le registre entier par pointeur (hot-reload, §5).
    pub async fn reload(&self, entries: Vec<TemplateFileEntry>) -> Result<()> {
        let mut map = HashMap::new();
        for entry in entries {
            let template = Self::validate_entry(entry)?;
            map.insert(template.name.clone(), template);
        }
        let mut guard = self.templates.write().await;
        *guard = Arc::new(map);
        Ok(())
    }

    /// Accès en temps constant après démarrage ; le nom doit figurer dans l'allowlist.
    pub async fn get(&self, name: &str) -> Result<PromptTemplate> {
        let templates = Arc::clone(&*self.templates.read().await);
        templates
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::TemplateUnknown {
                name: name.to_string(),
            })
    }

    pub async fn list_allowlisted(&self) -> Vec<String> {
        let templates = Arc::clone(&*self.templates.read().await);
        let mut names: Vec<String> = templates.keys().cloned().collect();
        names.sort();
        names
    }

    /// Substitue `{{var}}` dans le corps du template. Échoue si une variable
    /// déclarée est absente de `variables` ; aucune substitution par un nom de
    /// template non validé n'est jamais acceptée (le `name` n'intervient pas
    /// ici, seul `template` déjà résolu via `get`).
    pub fn render(
        template: &PromptTemplate,
        variables: &HashMap<String, String>,
    ) -> Result<String> {
        let mut rendered = template.body.clone();
        for var in &template.declared_variables {
            let value = match variables.get(var) {
                Some(v) => v,
                None => {
                    return Err(PipelineError::TemplateVariableMissing {
                        variable: var.clone(),
                    })
                }
            };
            let sanitized = sanitize_variable(value);
            rendered = rendered.replace(&format!("{{{{{var}}}}}"), &sanitized);
        }
        Ok(rendered)
    }
}

/// Tronque à `MAX_VARIABLE_LEN` et retire les octets nuls (§4.4 safety).
fn sanitize_variable(value: &str) -> String {
    let stripped: String = value.chars().filter(|c| *c != '\0').collect();
    if stripped.len() > MAX_VARIABLE_LEN {
        stripped.chars().take(MAX_VARIABLE_LEN).collect()
    } else {
        stripped
    }
}

fn extract_placeholders(body: &str) -> HashSet<String> {
    let mut placeholders = HashSet::new();
    let mut rest = body;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        if let Some(end) = after.find("}}") {
            placeholders.insert(after[..end].trim().to_string());
            rest = &after[end + 2..];
        } else {
            break;
        }
    }
    placeholders
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_registry_resolves_moderation_prompt() {
        let registry = TemplateRegistry::with_defaults().unwrap();
        let template = registry.get("moderation_prompt").await.unwrap();
        assert_eq!(template.version, 1);
    }

    #[tokio::test]
    async fn unknown_template_is_rejected() {
        let registry = TemplateRegistry::with_defaults().unwrap();
        assert!(registry.get("not_a_real_template").await.is_err());
    }

    #[tokio::test]
    async fn render_fills_all_declared_variables() {
        let registry = TemplateRegistry::with_defaults().unwrap();
        let template = registry.get("moderation_prompt").await.unwrap();
        let mut vars = HashMap::new();
        vars.insert("chat_message".to_string(), "hello".to_string());
        vars.insert("channel_id".to_string(), "c1".to_string());
        vars.insert("user_id".to_string(), "u1".to_string());
        vars.insert("history_summary".to_string(), "none".to_string());
        let rendered = TemplateRegistry::render(&template, &vars).unwrap();
        assert!(rendered.contains("hello"));
        assert!(!rendered.contains("{{"));
    }

    #[tokio::test]
    async fn render_fails_on_missing_variable() {
        let registry = TemplateRegistry::with_defaults().unwrap();
        let template = registry.get("moderation_prompt").await.unwrap();
        let vars = HashMap::new();
        let err = TemplateRegistry::render(&template, &vars).unwrap_err();
        assert!(matches!(err, PipelineError::TemplateVariableMissing { .. }));
    }

    #[test]
    fn rejects_undeclared_placeholder() {
        let entry = TemplateFileEntry {
            name: "bad".to_string(),
            version: 1,
            safety_level: SafetyLevel::Low,
            expected_output: ExpectedOutput::Text,
            body: "hello {{oops}}".to_string(),
            declared_variables: vec![],
        };
        assert!(TemplateRegistry::validate_entry(entry).is_err());
    }
}
