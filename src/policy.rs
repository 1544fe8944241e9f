use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, LazyLock};
use tera::{Context as TeraContext, Tera};
use tracing::{debug, warn};

use crate::cache::TranslationCache;
use crate::providers::retry::RetryPolicy;
use crate::providers::{Provider, ToolSpec};

pub const TOOL_NAME: &str = "deliver_translation";

const PROMPT_TEMPLATE: &str = include_str!("prompts/translate.tera");

static DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+$").expect("Invalid digits regex"));
static CURRENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$\d+([,\d]*\.?\d*)?$").expect("Invalid currency regex")
});
static UPPER_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9]{3,}$").expect("Invalid code regex"));

pub const DEFAULT_ABBREVIATIONS: [&str; 7] = ["N/A", "MRI", "MRA", "PET", "CT", "PCP", "EOC"];
pub const DEFAULT_MIN_ALPHABETIC: usize = 3;
const MAX_SKIPPED_CHARS: usize = 2;

const DEFAULT_GLOSSARY: [(&str, &str); 14] = [
    ("copay", "copago"),
    ("deductible", "deducible"),
    ("premium", "prima"),
    ("plan", "plan"),
    ("year", "año"),
    ("services", "servicios"),
    ("coverage", "cobertura"),
    ("benefits", "beneficios"),
    ("maximum", "máximo"),
    ("monthly", "mensual"),
    ("medical", "médico"),
    ("hospital", "hospital"),
    ("inpatient", "hospitalización"),
    ("outpatient", "ambulatorio"),
];

/// A pattern that keeps text away from the translator. Checked in list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EligibilityRule {
    Empty,
    Digits,
    Currency,
    UpperCode,
    MaxChars(usize),
    /// Compared upper-cased.
    Abbreviation(BTreeSet<String>),
    MinAlphabetic(usize),
}

impl EligibilityRule {
    /// `text` must already be trimmed.
    pub fn rejects(&self, text: &str) -> bool {
        match self {
            EligibilityRule::Empty => text.is_empty(),
            EligibilityRule::Digits => DIGITS.is_match(text),
            EligibilityRule::Currency => CURRENCY.is_match(text),
            EligibilityRule::UpperCode => UPPER_CODE.is_match(text),
            EligibilityRule::MaxChars(max) => text.chars().count() <= *max,
            EligibilityRule::Abbreviation(set) => set.contains(&text.to_uppercase()),
            EligibilityRule::MinAlphabetic(min) => {
                text.chars().filter(|ch| ch.is_alphabetic()).count() < *min
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EligibilityRule::Empty => "empty",
            EligibilityRule::Digits => "digits",
            EligibilityRule::Currency => "currency",
            EligibilityRule::UpperCode => "code",
            EligibilityRule::MaxChars(_) => "too-short",
            EligibilityRule::Abbreviation(_) => "abbreviation",
            EligibilityRule::MinAlphabetic(_) => "few-letters",
        }
    }
}

pub fn default_rules<I, S>(abbreviations: I, min_alphabetic: usize) -> Vec<EligibilityRule>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    vec![
        EligibilityRule::Empty,
        EligibilityRule::Digits,
        EligibilityRule::Currency,
        EligibilityRule::UpperCode,
        EligibilityRule::MaxChars(MAX_SKIPPED_CHARS),
        EligibilityRule::Abbreviation(
            abbreviations
                .into_iter()
                .map(|item| item.as_ref().trim().to_uppercase())
                .collect(),
        ),
        EligibilityRule::MinAlphabetic(min_alphabetic),
    ]
}

/// Returns the first rule rejecting `text`, if any.
pub fn rejected_by<'a>(rules: &'a [EligibilityRule], text: &str) -> Option<&'a EligibilityRule> {
    let trimmed = text.trim();
    rules.iter().find(|rule| rule.rejects(trimmed))
}

pub fn should_translate_text(rules: &[EligibilityRule], text: &str) -> bool {
    rejected_by(rules, text).is_none()
}

/// Fixed term list consulted for short phrases before the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Glossary {
    entries: HashMap<String, String>,
}

impl Default for Glossary {
    fn default() -> Self {
        Self {
            entries: DEFAULT_GLOSSARY
                .iter()
                .map(|(term, translation)| (term.to_string(), translation.to_string()))
                .collect(),
        }
    }
}

impl Glossary {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn with_entries<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (term, translation) in entries {
            self.entries
                .insert(term.as_ref().trim().to_lowercase(), translation.into());
        }
        self
    }

    /// Only phrases of at most two words are looked up.
    pub fn lookup(&self, text: &str) -> Option<&str> {
        let trimmed = text.trim();
        if trimmed.split_whitespace().count() > 2 {
            return None;
        }
        self.entries.get(&trimmed.to_lowercase()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub source_language: String,
    pub target_language: String,
    pub domain: String,
    pub glossary: Glossary,
    pub rules: Vec<EligibilityRule>,
    pub protected_terms: Vec<String>,
    pub example_codes: Vec<String>,
    pub retry: RetryPolicy,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            source_language: "English".to_string(),
            target_language: "Spanish".to_string(),
            domain: "medical and insurance".to_string(),
            glossary: Glossary::default(),
            rules: default_rules(DEFAULT_ABBREVIATIONS, DEFAULT_MIN_ALPHABETIC),
            protected_terms: vec![
                "Apple Health".to_string(),
                "Medicaid".to_string(),
                "Medicare Part A".to_string(),
                "Part B".to_string(),
                "Part D".to_string(),
            ],
            example_codes: vec!["H5619136002".to_string(), "N/A".to_string()],
            retry: RetryPolicy::default(),
        }
    }
}

/// How a piece of text was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Ineligible(&'static str),
    Glossary(String),
    Cached(String),
    Translated(String),
    /// The backend gave up; the source text stands.
    Unchanged,
}

impl Resolution {
    pub fn into_text(self, original: &str) -> String {
        match self {
            Resolution::Glossary(text) | Resolution::Cached(text) | Resolution::Translated(text) => {
                text
            }
            Resolution::Ineligible(_) | Resolution::Unchanged => original.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolArgs {
    translation: String,
}

/// Decides what to send to the backend and cleans what comes back.
pub struct TranslationPolicy<P> {
    provider: P,
    config: PolicyConfig,
    cache: Arc<TranslationCache>,
    system_prompt: String,
}

impl<P: Provider> TranslationPolicy<P> {
    pub fn new(provider: P, config: PolicyConfig, cache: Arc<TranslationCache>) -> Result<Self> {
        let system_prompt = render_system_prompt(&config, TOOL_NAME)?;
        Ok(Self {
            provider,
            config,
            cache,
            system_prompt,
        })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TranslationCache> {
        &self.cache
    }

    pub fn is_eligible(&self, text: &str) -> bool {
        should_translate_text(&self.config.rules, text)
    }

    /// Never fails: backend errors degrade to the original text.
    pub async fn translate(&self, text: &str) -> String {
        self.resolve(text).await.into_text(text)
    }

    pub async fn resolve(&self, text: &str) -> Resolution {
        if let Some(rule) = rejected_by(&self.config.rules, text) {
            return Resolution::Ineligible(rule.name());
        }
        if let Some(term) = self.config.glossary.lookup(text) {
            return Resolution::Glossary(term.to_string());
        }
        let source = text.trim();
        if let Some(hit) = self.cache.get(source) {
            return Resolution::Cached(hit);
        }

        let result = self
            .config
            .retry
            .run("translation request", |_| self.request(source))
            .await;
        match result {
            Ok(translated) => {
                self.cache.insert(source, &translated);
                debug!(source, translated = %translated, "translated span");
                Resolution::Translated(translated)
            }
            Err(err) => {
                warn!("translation failed, keeping original text {:?}: {:#}", source, err);
                Resolution::Unchanged
            }
        }
    }

    async fn request(&self, text: &str) -> Result<String> {
        let response = self
            .provider
            .clone()
            .append_system_input(self.system_prompt.clone())
            .append_user_input(text.to_string())
            .register_tool(tool_spec(TOOL_NAME))
            .call_tool(TOOL_NAME)
            .await?;
        self.cache
            .record_usage(response.model.clone(), response.usage.clone());
        let args: ToolArgs = serde_json::from_value(response.args)
            .with_context(|| "failed to parse translation tool arguments")?;
        let cleaned = clean_response(&args.translation, &self.config.target_language);
        if cleaned.is_empty() {
            return Err(anyhow!("backend returned an empty translation"));
        }
        Ok(cleaned)
    }
}

pub fn tool_spec(tool_name: &str) -> ToolSpec {
    ToolSpec {
        name: tool_name.to_string(),
        description: "Return the translated text.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "translation": {"type": "string"}
            },
            "required": ["translation"]
        }),
    }
}

pub fn render_system_prompt(config: &PolicyConfig, tool_name: &str) -> Result<String> {
    let mut context = TeraContext::new();
    context.insert("source_lang", config.source_language.as_str());
    context.insert("target_lang", config.target_language.as_str());
    context.insert("domain", config.domain.as_str());
    context.insert("protected_terms", &config.protected_terms);
    context.insert("example_codes", &config.example_codes);
    context.insert("tool_name", tool_name);
    Tera::one_off(PROMPT_TEMPLATE, &context, false)
        .with_context(|| "failed to render system prompt")
}

const QUOTES: [char; 8] = ['"', '\'', '“', '”', '‘', '’', '«', '»'];

fn is_quote(ch: char) -> bool {
    QUOTES.contains(&ch)
}

fn strip_surrounding_quotes(text: &str) -> &str {
    let mut current = text.trim();
    loop {
        let mut chars = current.chars();
        match (chars.next(), chars.next_back()) {
            (Some(first), Some(last)) if is_quote(first) && is_quote(last) => {
                current = current[first.len_utf8()..current.len() - last.len_utf8()].trim();
            }
            _ => return current,
        }
    }
}

fn strip_label<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    let head = text.get(..label.len())?;
    if head.eq_ignore_ascii_case(label) {
        Some(text[label.len()..].trim_start())
    } else {
        None
    }
}

/// Removes wrapping quotes and a leading "Translation:"-style label.
pub fn clean_response(raw: &str, target_language: &str) -> String {
    let mut text = strip_surrounding_quotes(raw);
    let language_label = format!("{}:", target_language.trim());
    let labels = ["Translation:", "Traducción:", language_label.as_str()];
    for label in labels {
        if let Some(rest) = strip_label(text, label) {
            text = rest;
            break;
        }
    }
    strip_surrounding_quotes(text).to_string()
}
