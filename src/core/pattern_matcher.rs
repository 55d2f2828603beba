//! # Pattern Matcher (C2)
//!
//! Trois jeux de règles compilés une fois au démarrage, chacun versionné :
//! mots bannis (insensible à la casse, limite de mot), regex toxiques, et
//! regex PII (email, téléphone E.164-ish, IP, heuristiques d'adresse). Le
//! matcher renvoie la première catégorie terminale par jeu de règles et
//! continue à travers les jeux pour collecter toutes les catégories
//! matchées. Normalisation Unicode NFKC avant matching (§4.2).
//!
//! Chargé depuis un `pattern_file` TOML structuré, dans l'esprit des tables
//! de `AdvancedModerationConfig::default()` du teacher mais externalisé pour
//! permettre le hot-reload par pointeur (§5).

use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use unicode_normalization::UnicodeNormalization;

use crate::error::{PipelineError, Result};
use crate::models::PatternType;

/// Jeu de règles brut, tel que chargé depuis le fichier TOML de configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PatternRules {
    pub version: u32,
    #[serde(default)]
    pub banned_words: Vec<String>,
    #[serde(default)]
    pub toxic_patterns: Vec<String>,
    #[serde(default)]
    pub pii_patterns: Vec<NamedPattern>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NamedPattern {
    pub id: String,
    pub regex: String,
}

impl Default for PatternRules {
    fn default() -> Self {
        Self {
            version: 1,
            banned_words: vec![
                "slur1".to_string(),
                "slur2".to_string(),
                "hardcoded_banned_word".to_string(),
            ],
            toxic_patterns: vec![
                r"(?i)\bi will (kill|hurt) you\b".to_string(),
                r"(?i)\bkys\b".to_string(),
            ],
            pii_patterns: vec![
                NamedPattern {
                    id: "email".to_string(),
                    regex: r"(?i)[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}".to_string(),
                },
                NamedPattern {
                    id: "phone".to_string(),
                    regex: r"\+?[0-9][0-9\-\s]{7,14}[0-9]".to_string(),
                },
                NamedPattern {
                    id: "ip_address".to_string(),
                    regex: r"\b(?:\d{1,3}\.){3}\d{1,3}\b".to_string(),
                },
                NamedPattern {
                    id: "credit_card".to_string(),
                    regex: r"\b(?:\d[ -]*?){13,16}\b".to_string(),
                },
            ],
        }
    }
}

/// Automate compilé une fois, immuable après construction.
///
/// Hot-reload : un nouveau `CompiledPatterns` remplace le pointeur tenu par
/// le caller (typiquement `RwLock<Arc<CompiledPatterns>>`), les lecteurs en
/// vol voient l'ancien ou le nouveau jeu complet, jamais un mélange (§5).
#[derive(Debug)]
pub struct CompiledPatterns {
    version: u32,
    banned_words: RegexSet,
    banned_word_ids: Vec<String>,
    toxic_patterns: RegexSet,
    toxic_pattern_ids: Vec<String>,
    pii_patterns: Vec<(String, Regex)>,
}

impl CompiledPatterns {
    pub fn compile(rules: &PatternRules) -> Result<Self> {
        let banned_regexes: Vec<String> = rules
            .banned_words
            .iter()
            .map(|w| format!(r"(?i)\b{}\b", regex::escape(w)))
            .collect();
        let banned_words = RegexSet::new(&banned_regexes)
            .map_err(|e| PipelineError::FilterInternalError { reason: e.to_string() })?;

        let toxic_patterns = RegexSet::new(&rules.toxic_patterns)
            .map_err(|e| PipelineError::FilterInternalError { reason: e.to_string() })?;

        let mut pii_patterns = Vec::with_capacity(rules.pii_patterns.len());
        for p in &rules.pii_patterns {
            let compiled = Regex::new(&p.regex)
                .map_err(|e| PipelineError::FilterInternalError { reason: e.to_string() })?;
            pii_patterns.push((p.id.clone(), compiled));
        }

        Ok(Self {
            version: rules.version,
            banned_words,
            banned_word_ids: rules.banned_words.clone(),
            toxic_patterns,
            toxic_pattern_ids: (0..rules.toxic_patterns.len())
                .map(|i| format!("toxic_{i}"))
                .collect(),
            pii_patterns,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::configuration_error(format!(
                "cannot read pattern_file {}: {e}",
                path.display()
            ))
        })?;
        let rules: PatternRules = toml::from_str(&content).map_err(|e| {
            PipelineError::configuration_error(format!("invalid pattern_file: {e}"))
        })?;
        Self::compile(&rules)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Résultat du matching : catégories touchées, identifiants des motifs
    /// matchés, et le type de motif "le plus sévère" observé (banned_word >
    /// toxic_regex > pii > none) pour déterminer le court-circuit côté C3.
    pub fn scan(&self, body: &str) -> MatchResult {
        let normalized: String = body.nfkc().collect();

        let mut matched_ids = Vec::new();
        let mut categories = HashSet::new();
        let mut most_severe = PatternType::None;

        let banned_hits: Vec<usize> = self.banned_words.matches(&normalized).into_iter().collect();
        if !banned_hits.is_empty() {
            for idx in banned_hits {
                matched_ids.push(format!("banned_word:{}", self.banned_word_ids[idx]));
            }
            categories.insert("banned_word".to_string());
            most_severe = PatternType::BannedWord;
        }

        let toxic_hits: Vec<usize> = self.toxic_patterns.matches(&normalized).into_iter().collect();
        if !toxic_hits.is_empty() {
            for idx in toxic_hits {
                matched_ids.push(format!("toxic:{}", self.toxic_pattern_ids[idx]));
            }
            categories.insert("toxic".to_string());
            if most_severe == PatternType::None {
                most_severe = PatternType::ToxicRegex;
            }
        }

        for (id, re) in &self.pii_patterns {
            if re.is_match(&normalized) {
                matched_ids.push(format!("pii:{id}"));
                categories.insert("pii".to_string());
                if most_severe == PatternType::None {
                    most_severe = PatternType::Pii;
                }
            }
        }

        MatchResult {
            matched_ids,
            categories,
            pattern_type: most_severe,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub matched_ids: Vec<String>,
    pub categories: HashSet<String>,
    pub pattern_type: PatternType,
}

impl MatchResult {
    pub fn is_clean(&self) -> bool {
        self.pattern_type == PatternType::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> CompiledPatterns {
        CompiledPatterns::compile(&PatternRules::default()).unwrap()
    }

    #[test]
    fn detects_banned_word_case_insensitive() {
        let m = matcher();
        let result = m.scan("this message contains Hardcoded_Banned_Word right here");
        assert_eq!(result.pattern_type, PatternType::BannedWord);
    }

    #[test]
    fn detects_pii_email() {
        let m = matcher();
        let result = m.scan("reach me at alice@example.com please");
        assert_eq!(result.pattern_type, PatternType::Pii);
        assert!(result.categories.contains("pii"));
    }

    #[test]
    fn clean_message_has_no_match() {
        let m = matcher();
        let result = m.scan("hello everyone, how are you?");
        assert!(result.is_clean());
    }

    #[test]
    fn banned_word_outranks_pii_as_most_severe() {
        let m = matcher();
        let result = m.scan("hardcoded_banned_word and alice@example.com");
        assert_eq!(result.pattern_type, PatternType::BannedWord);
        assert!(result.categories.contains("pii"));
    }
}
