use anyhow::{Context, Result, anyhow};
use image::DynamicImage;
use std::path::Path;
use std::process::Command;
use tracing::warn;

use super::{Recognizer, normalize_recognized};

pub fn list_tesseract_languages() -> Result<Vec<String>> {
    let output = Command::new("tesseract")
        .arg("--list-langs")
        .output()
        .with_context(|| "failed to run tesseract --list-langs")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("tesseract --list-langs failed: {}", stderr.trim()));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_language_list(&stdout))
}

fn parse_language_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

/// Keeps the requested languages tesseract actually has; errors when none remain.
fn select_languages(requested: &str, available: &[String]) -> Result<String> {
    let trimmed = requested.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("ocr languages is empty"));
    }

    let mut chosen = Vec::new();
    let mut missing = Vec::new();
    for raw in trimmed.split(['+', ',', ' ']) {
        let lang = raw.trim();
        if lang.is_empty() {
            continue;
        }
        if available.iter().any(|value| value == lang) {
            chosen.push(lang.to_string());
        } else {
            missing.push(lang.to_string());
        }
    }

    if chosen.is_empty() {
        return Err(anyhow!(
            "ocr language(s) not available: {} (available: {})",
            missing.join(", "),
            available.join(", ")
        ));
    }
    if !missing.is_empty() {
        warn!(
            "ocr language(s) not available: {} (available: {})",
            missing.join(", "),
            available.join(", ")
        );
    }
    Ok(chosen.join("+"))
}

/// Recognizer backed by the `tesseract` command-line tool.
#[derive(Debug, Clone)]
pub struct TesseractRecognizer {
    languages: String,
    psm: u32,
}

impl TesseractRecognizer {
    /// Validates `languages` against the installed traineddata when tesseract can list them.
    pub fn new(languages: &str) -> Result<Self> {
        let languages = match list_tesseract_languages() {
            Ok(available) => select_languages(languages, &available)?,
            Err(_) => languages.trim().to_string(),
        };
        if languages.is_empty() {
            return Err(anyhow!("ocr languages is empty"));
        }
        Ok(Self { languages, psm: 6 })
    }

    pub fn languages(&self) -> &str {
        &self.languages
    }

    fn run(&self, path: &Path) -> Result<String> {
        let output = Command::new("tesseract")
            .arg(path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.languages)
            .arg("--oem")
            .arg("1")
            .arg("--psm")
            .arg(self.psm.to_string())
            .output()
            .with_context(|| "failed to run tesseract (is it installed?)")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("tesseract failed: {}", stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Recognizer for TesseractRecognizer {
    fn recognize(&self, image: &DynamicImage) -> Result<String> {
        let file = tempfile::Builder::new()
            .prefix("ocr-")
            .suffix(".png")
            .tempfile()
            .with_context(|| "failed to create temp image for OCR")?;
        image
            .save_with_format(file.path(), image::ImageFormat::Png)
            .with_context(|| "failed to write temp image for OCR")?;
        let text = self.run(file.path())?;
        Ok(normalize_recognized(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_list_skips_the_header() {
        let stdout = "List of available languages in \"/usr/share/tessdata/\" (3):\neng\nosd\nspa\n";
        assert_eq!(parse_language_list(stdout), vec!["eng", "osd", "spa"]);
    }

    #[test]
    fn unavailable_languages_are_dropped() {
        let available = vec!["eng".to_string(), "spa".to_string()];
        assert_eq!(select_languages("eng+jpn, spa", &available).unwrap(), "eng+spa");
        assert!(select_languages("jpn", &available).is_err());
        assert!(select_languages("  ", &available).is_err());
    }
}
