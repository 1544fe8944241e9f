use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::image_text::{FallbackPlacement, ImageMode};
use crate::pipeline::DEFAULT_BACKGROUND_ZOOM;
use crate::policy::{DEFAULT_ABBREVIATIONS, DEFAULT_MIN_ALPHABETIC, Glossary, PolicyConfig, default_rules};
use crate::providers::retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, RetryPolicy};

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub source_language: String,
    pub target_language: String,
    pub domain: String,
    pub glossary: BTreeMap<String, String>,
    pub abbreviations: Vec<String>,
    pub min_alphabetic: usize,
    pub protected_terms: Vec<String>,
    pub example_codes: Vec<String>,
    pub retry_attempts: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub concurrency: usize,
    pub preserve_background: bool,
    pub background_zoom: f32,
    pub shrink_to_fit: bool,
    pub translate_images: bool,
    pub image_mode: ImageMode,
    pub image_fallback: FallbackPlacement,
    pub ocr_languages: String,
    pub overlay_text_color: String,
    pub overlay_fill_color: String,
    pub overlay_font_size: f32,
    pub overlay_font_family: Option<String>,
    pub overlay_font_path: Option<String>,
    pub model: Option<String>,
    pub ca_cert: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            source_language: "English".to_string(),
            target_language: "Spanish".to_string(),
            domain: "medical and insurance".to_string(),
            glossary: BTreeMap::new(),
            abbreviations: DEFAULT_ABBREVIATIONS.iter().map(|abbr| abbr.to_string()).collect(),
            min_alphabetic: DEFAULT_MIN_ALPHABETIC,
            protected_terms: ["Apple Health", "Medicaid", "Medicare Part A", "Part B", "Part D"]
                .iter()
                .map(|term| term.to_string())
                .collect(),
            example_codes: vec!["H5619136002".to_string(), "N/A".to_string()],
            retry_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay: DEFAULT_BASE_DELAY,
            retry_max_delay: DEFAULT_MAX_DELAY,
            concurrency: 1,
            preserve_background: false,
            background_zoom: DEFAULT_BACKGROUND_ZOOM,
            shrink_to_fit: false,
            translate_images: true,
            image_mode: ImageMode::Overlay,
            image_fallback: FallbackPlacement::FixedOrigin,
            ocr_languages: "eng".to_string(),
            overlay_text_color: "#000000".to_string(),
            overlay_fill_color: "#ffffff".to_string(),
            overlay_font_size: 18.0,
            overlay_font_family: None,
            overlay_font_path: None,
            model: None,
            ca_cert: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    translation: Option<TranslationSettings>,
    glossary: Option<BTreeMap<String, String>>,
    policy: Option<PolicySettings>,
    retry: Option<RetrySettings>,
    layout: Option<LayoutSettings>,
    images: Option<ImageSettings>,
    provider: Option<ProviderSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct TranslationSettings {
    source: Option<String>,
    target: Option<String>,
    domain: Option<String>,
    concurrency: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct PolicySettings {
    abbreviations: Option<Vec<String>>,
    min_alphabetic: Option<usize>,
    protected_terms: Option<Vec<String>>,
    example_codes: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RetrySettings {
    attempts: Option<usize>,
    base_delay_secs: Option<f64>,
    max_delay_secs: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct LayoutSettings {
    preserve_background: Option<bool>,
    background_zoom: Option<f32>,
    shrink_to_fit: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageSettings {
    enabled: Option<bool>,
    mode: Option<ImageMode>,
    fallback: Option<FallbackPlacement>,
    ocr_languages: Option<String>,
    text_color: Option<String>,
    fill_color: Option<String>,
    font_size: Option<f32>,
    font_family: Option<String>,
    font_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderSettings {
    model: Option<String>,
    ca_cert: Option<String>,
}

/// Built-in defaults, then the embedded `settings.toml`, then `settings.toml` and
/// `settings.local.toml` in the working directory and in `~/.layout-translator`, then
/// `extra_path`. Later files win key by key.
pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    settings.merge(parse_settings(DEFAULT_SETTINGS_TOML, Path::new("<embedded settings.toml>"))?);

    let mut ordered_paths = vec![
        PathBuf::from("settings.toml"),
        PathBuf::from("settings.local.toml"),
    ];
    if let Some(home) = home_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }
    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            settings.merge(parse_settings(&content, &path)?);
        }
    }

    Ok(settings)
}

fn parse_settings(content: &str, path: &Path) -> Result<SettingsFile> {
    toml::from_str(content).with_context(|| format!("failed to parse settings: {}", path.display()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn seconds(value: f64) -> Option<Duration> {
    (value.is_finite() && value >= 0.0).then(|| Duration::from_secs_f64(value))
}

impl Settings {
    fn merge(&mut self, incoming: SettingsFile) {
        if let Some(translation) = incoming.translation {
            if let Some(source) = non_empty(translation.source) {
                self.source_language = source;
            }
            if let Some(target) = non_empty(translation.target) {
                self.target_language = target;
            }
            if let Some(domain) = non_empty(translation.domain) {
                self.domain = domain;
            }
            if let Some(concurrency) = translation.concurrency.filter(|value| *value > 0) {
                self.concurrency = concurrency;
            }
        }
        if let Some(glossary) = incoming.glossary {
            self.glossary.extend(glossary);
        }
        if let Some(policy) = incoming.policy {
            if let Some(abbreviations) = policy.abbreviations {
                self.abbreviations = abbreviations;
            }
            if let Some(min) = policy.min_alphabetic {
                self.min_alphabetic = min;
            }
            if let Some(terms) = policy.protected_terms {
                self.protected_terms = terms;
            }
            if let Some(codes) = policy.example_codes {
                self.example_codes = codes;
            }
        }
        if let Some(retry) = incoming.retry {
            if let Some(attempts) = retry.attempts.filter(|value| *value > 0) {
                self.retry_attempts = attempts;
            }
            if let Some(delay) = retry.base_delay_secs.and_then(seconds) {
                self.retry_base_delay = delay;
            }
            if let Some(delay) = retry.max_delay_secs.and_then(seconds) {
                self.retry_max_delay = delay;
            }
        }
        if let Some(layout) = incoming.layout {
            if let Some(preserve) = layout.preserve_background {
                self.preserve_background = preserve;
            }
            if let Some(zoom) = layout.background_zoom.filter(|zoom| *zoom > 0.0) {
                self.background_zoom = zoom;
            }
            if let Some(shrink) = layout.shrink_to_fit {
                self.shrink_to_fit = shrink;
            }
        }
        if let Some(images) = incoming.images {
            if let Some(enabled) = images.enabled {
                self.translate_images = enabled;
            }
            if let Some(mode) = images.mode {
                self.image_mode = mode;
            }
            if let Some(fallback) = images.fallback {
                self.image_fallback = fallback;
            }
            if let Some(languages) = non_empty(images.ocr_languages) {
                self.ocr_languages = languages;
            }
            if let Some(color) = non_empty(images.text_color) {
                self.overlay_text_color = color;
            }
            if let Some(color) = non_empty(images.fill_color) {
                self.overlay_fill_color = color;
            }
            if let Some(size) = images.font_size.filter(|size| *size > 0.0) {
                self.overlay_font_size = size;
            }
            if let Some(family) = non_empty(images.font_family) {
                self.overlay_font_family = Some(family);
            }
            if let Some(path) = non_empty(images.font_path) {
                self.overlay_font_path = Some(path);
            }
        }
        if let Some(provider) = incoming.provider {
            if let Some(model) = non_empty(provider.model) {
                self.model = Some(model);
            }
            if let Some(path) = non_empty(provider.ca_cert) {
                self.ca_cert = Some(PathBuf::from(path));
            }
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }

    /// Policy configuration for `target_language`, or the configured target when `None`.
    pub fn policy_config(&self, target_language: Option<&str>) -> PolicyConfig {
        let target = target_language
            .map(str::trim)
            .filter(|lang| !lang.is_empty())
            .unwrap_or(&self.target_language);
        PolicyConfig {
            source_language: self.source_language.clone(),
            target_language: target.to_string(),
            domain: self.domain.clone(),
            glossary: Glossary::default().with_entries(self.glossary.clone()),
            rules: default_rules(&self.abbreviations, self.min_alphabetic),
            protected_terms: self.protected_terms.clone(),
            example_codes: self.example_codes.clone(),
            retry: self.retry_policy(),
        }
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".layout-translator"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_file_matches_builtin_defaults() {
        let mut settings = Settings::default();
        settings.merge(parse_settings(DEFAULT_SETTINGS_TOML, Path::new("embedded")).unwrap());
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn later_files_override_key_by_key() {
        let mut settings = Settings::default();
        settings.merge(
            parse_settings(
                r#"
                [translation]
                target = "French"
                concurrency = 4

                [glossary]
                copay = "ticket modérateur"

                [images]
                mode = "redact-and-draw"
                fallback = "center"
                font_size = 0.0
                "#,
                Path::new("test.toml"),
            )
            .unwrap(),
        );
        assert_eq!(settings.target_language, "French");
        assert_eq!(settings.source_language, "English");
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.image_mode, ImageMode::RedactAndDraw);
        assert_eq!(settings.image_fallback, FallbackPlacement::Center);
        assert_eq!(settings.overlay_font_size, 18.0);

        let policy = settings.policy_config(None);
        assert_eq!(policy.target_language, "French");
        assert_eq!(policy.glossary.lookup("Copay"), Some("ticket modérateur"));
        assert_eq!(policy.glossary.lookup("deductible"), Some("deducible"));
        assert_eq!(settings.policy_config(Some("German")).target_language, "German");
    }

    #[test]
    fn retry_delays_accept_fractions() {
        let mut settings = Settings::default();
        settings.merge(
            parse_settings("[retry]\nattempts = 5\nbase_delay_secs = 0.5\nmax_delay_secs = -1.0", Path::new("t"))
                .unwrap(),
        );
        let retry = settings.retry_policy();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.base_delay, Duration::from_millis(500));
        assert_eq!(retry.max_delay, DEFAULT_MAX_DELAY);
    }

    #[test]
    fn missing_extra_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_settings(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("settings file not found"));
    }

    #[test]
    fn malformed_files_name_their_path() {
        let err = parse_settings("[layout\n", Path::new("broken.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("broken.toml"));
    }
}
