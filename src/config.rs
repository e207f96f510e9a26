use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::PathBuf;
use tracing::warn;

use crate::models::SearchIntent;

/// Process-level settings. Feature gates and file locations come from the
/// environment; missing critical variables abort before the first cycle.
#[derive(Debug, Clone)]
pub struct Settings {
    pub check_sustainability: bool,
    pub crawl_enabled: bool,
    pub skip_jd_fetch: bool,
    pub data_dir: PathBuf,
    pub filters_path: PathBuf,
    pub resume_profile_path: PathBuf,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let critical = ["ANALYSIS_SERVER_URL", "ANALYSIS_API_KEY", "FIT_API_KEY"];
        let missing: Vec<&str> = critical
            .into_iter()
            .filter(|name| env::var(name).map(|v| v.is_empty()).unwrap_or(true))
            .collect();
        if !missing.is_empty() {
            return Err(anyhow!(
                "Missing required environment variables: {}. Check your .env file.",
                missing.join(", ")
            ));
        }

        Ok(Self {
            check_sustainability: env_flag("CHECK_SUSTAINABILITY"),
            crawl_enabled: env_flag("CRAWL_ENABLED"),
            skip_jd_fetch: env_flag("SKIP_JD_FETCH"),
            data_dir: default_data_dir(),
            filters_path: env::var("FILTERS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("filters.yaml")),
            resume_profile_path: env::var("RESUME_PROFILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("resume_profile.json")),
        })
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

pub fn default_data_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "prospect") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from("prospect_data")
    }
}

/// User-authored filtering rules plus the few fields the pipeline writes back
/// (discovered skip keywords, generated search parameters). The pipeline only
/// ever appends; it never deletes user entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub job_title_skip_keywords: Vec<String>,
    pub job_title_skip_words: Vec<String>,
    pub company_skip_keywords: Vec<String>,
    pub location_skip_keywords: Vec<String>,
    pub location_priorities: BTreeMap<String, i64>,
    pub sustainability_keywords: SustainabilityKeywords,
    pub search_parameters: Vec<SearchIntent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SustainabilityKeywords {
    pub positive: Vec<String>,
    pub negative: Vec<String>,
    /// Also scan the company overview for negative keywords.
    pub scan_overview: bool,
}

impl FilterConfig {
    fn skip_list_mut(&mut self, name: &str) -> Option<&mut Vec<String>> {
        match name {
            "job_title_skip_keywords" => Some(&mut self.job_title_skip_keywords),
            "job_title_skip_words" => Some(&mut self.job_title_skip_words),
            "company_skip_keywords" => Some(&mut self.company_skip_keywords),
            "location_skip_keywords" => Some(&mut self.location_skip_keywords),
            _ => None,
        }
    }

    /// Append newly discovered skip keywords, deduplicated case-insensitively
    /// against what is already configured. Returns true if anything was added.
    pub fn merge_skip_keywords(&mut self, discovered: &HashMap<String, Vec<String>>) -> bool {
        let mut changed = false;
        for (list_name, keywords) in discovered {
            let Some(list) = self.skip_list_mut(list_name) else {
                warn!(list = %list_name, "Ignoring unknown skip keyword list from service");
                continue;
            };
            let mut existing: std::collections::HashSet<String> =
                list.iter().map(|k| k.to_lowercase()).collect();
            for keyword in keywords {
                let trimmed = keyword.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if existing.insert(trimmed.to_lowercase()) {
                    list.push(trimmed.to_string());
                    changed = true;
                }
            }
        }
        changed
    }
}

/// Reads and writes `filters.yaml`. An unreadable or invalid file degrades to
/// the default (empty) configuration instead of halting the pipeline.
#[derive(Debug, Clone)]
pub struct FilterStore {
    path: PathBuf,
}

impl FilterStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> FilterConfig {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_yaml::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Invalid filter config, using defaults");
                    FilterConfig::default()
                }
            },
            Err(_) => FilterConfig::default(),
        }
    }

    pub fn save(&self, config: &FilterConfig) -> Result<()> {
        let text = serde_yaml::to_string(config).context("Failed to serialize filter config")?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }

    /// Write a default config file if none exists yet.
    pub fn ensure_exists(&self) -> Result<()> {
        if !self.path.exists() {
            self.save(&FilterConfig::default())?;
        }
        Ok(())
    }
}

/// Read-only structured resume used as context for analysis and generation.
#[derive(Debug, Clone)]
pub struct ResumeProfile {
    raw: serde_json::Value,
    pub full_name: String,
}

impl ResumeProfile {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read resume profile: {}", path.display()))?;
        let raw: serde_json::Value =
            serde_json::from_str(&text).context("Failed to parse resume profile JSON")?;
        Self::from_value(raw)
    }

    pub fn from_value(raw: serde_json::Value) -> Result<Self> {
        let full_name = raw
            .pointer("/personal/full_name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Resume profile is missing personal.full_name"))?;
        Ok(Self { raw, full_name })
    }

    pub fn json(&self) -> &serde_json::Value {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_merge_skip_keywords_dedups_case_insensitively() {
        let mut config = FilterConfig {
            job_title_skip_keywords: vec!["Java".into()],
            ..Default::default()
        };
        let discovered = HashMap::from([
            (
                "job_title_skip_keywords".to_string(),
                vec!["java".to_string(), "WordPress".to_string(), "".to_string()],
            ),
            ("unknown_list".to_string(), vec!["x".to_string()]),
        ]);

        assert!(config.merge_skip_keywords(&discovered));
        assert_eq!(config.job_title_skip_keywords, vec!["Java", "WordPress"]);

        // Second merge adds nothing new.
        assert!(!config.merge_skip_keywords(&discovered));
    }

    #[test]
    fn test_filter_store_defaults_on_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "job_title_skip_keywords: {{ not: [valid").unwrap();
        let store = FilterStore::new(file.path().to_path_buf());
        assert_eq!(store.load(), FilterConfig::default());
    }

    #[test]
    fn test_filter_store_round_trip() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = FilterStore::new(file.path().to_path_buf());
        let mut config = FilterConfig::default();
        config.location_skip_keywords.push("on-site".into());
        config.location_priorities.insert("berlin".into(), 1);
        store.save(&config).unwrap();
        assert_eq!(store.load(), config);
    }

    #[test]
    fn test_resume_profile_requires_full_name() {
        let ok = serde_json::json!({"personal": {"full_name": "Ada Lovelace"}, "skills": []});
        assert_eq!(ResumeProfile::from_value(ok).unwrap().full_name, "Ada Lovelace");

        let missing = serde_json::json!({"skills": []});
        assert!(ResumeProfile::from_value(missing).is_err());
    }
}
