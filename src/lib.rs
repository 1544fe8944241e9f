use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub mod background;
pub mod cache;
pub mod document;
pub mod fonts;
pub mod image_text;
pub mod logging;
pub mod ocr;
pub mod pipeline;
pub mod policy;
pub mod providers;
pub mod redaction;
pub mod reinsert;
pub mod settings;
pub mod span;
#[cfg(test)]
mod test_util;

pub use document::{Document, PageSurface, PdfDocument};
pub use image_text::{FallbackPlacement, ImageMode, ImageOptions};
pub use ocr::{OverlayStyle, Recognizer, TesseractRecognizer};
pub use pipeline::{DocumentReport, PageReport, PipelineOptions, Services, translate_document};
pub use policy::{PolicyConfig, TranslationPolicy};
pub use providers::{OpenAI, Provider, ProviderKind, ProviderUsage};

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Target language name; the settings value when `None`.
    pub lang: Option<String>,
    pub model: Option<String>,
    pub key: Option<String>,
    pub settings_path: Option<PathBuf>,
    pub image_mode: Option<ImageMode>,
    pub no_images: bool,
    pub preserve_background: bool,
    pub shrink_to_fit: bool,
    pub concurrency: Option<usize>,
    pub deadline_secs: Option<u64>,
    pub ocr_lang: Option<String>,
    pub debug_images: Option<PathBuf>,
}

pub async fn run(config: Config) -> Result<DocumentReport> {
    if !config.input.is_file() {
        return Err(anyhow!("input file not found: {}", config.input.display()));
    }
    let settings = settings::load_settings(config.settings_path.as_deref())?;

    let model = config.model.as_deref().or(settings.model.as_deref());
    let provider_config =
        providers::resolve_provider_config(model, config.key.as_deref(), settings.ca_cert.clone())
            .with_context(|| "no translation backend credentials found")?;
    let provider = providers::build_provider(&provider_config)?;
    debug!(
        provider = provider_config.kind.as_str(),
        model = provider.model(),
        "translation backend ready"
    );

    let policy_config = settings.policy_config(config.lang.as_deref());
    let policy = TranslationPolicy::new(provider, policy_config, Default::default())?;

    let translate_images = settings.translate_images && !config.no_images;
    let ocr_languages = config.ocr_lang.as_deref().unwrap_or(&settings.ocr_languages);
    let recognizer = if translate_images {
        build_recognizer(ocr_languages)
    } else {
        None
    };

    let options = PipelineOptions {
        preserve_background: settings.preserve_background || config.preserve_background,
        background_zoom: settings.background_zoom,
        shrink_to_fit: settings.shrink_to_fit || config.shrink_to_fit,
        translate_images,
        concurrency: config.concurrency.unwrap_or(settings.concurrency).max(1),
        deadline: config.deadline_secs.map(Duration::from_secs),
        images: ImageOptions {
            mode: config.image_mode.unwrap_or(settings.image_mode),
            fallback: settings.image_fallback,
            overlay: overlay_style(&settings),
            debug_dir: config.debug_images.clone(),
        },
    };

    let services = Services::new(policy, recognizer);
    translate_document::<PdfDocument, _>(&config.input, &config.output, &services, &options).await
}

/// Image translation is optional: without tesseract the run continues on text only.
fn build_recognizer(languages: &str) -> Option<Box<dyn Recognizer>> {
    match TesseractRecognizer::new(languages) {
        Ok(recognizer) => Some(Box::new(recognizer)),
        Err(err) => {
            warn!("image translation disabled: {err:#}");
            None
        }
    }
}

fn overlay_style(settings: &settings::Settings) -> OverlayStyle {
    let mut style = OverlayStyle {
        text_color: settings.overlay_text_color.clone(),
        fill_color: settings.overlay_fill_color.clone(),
        font_size: settings.overlay_font_size,
        ..OverlayStyle::default()
    };
    let resolved = ocr::resolve_overlay_font(
        settings.overlay_font_path.as_deref().map(Path::new),
        settings.overlay_font_family.as_deref(),
        overlay_fallback_fonts(),
    );
    match resolved {
        Ok(font) => {
            style.font_family = Some(font.family);
            style.font_metrics = Some(font.metrics);
        }
        Err(err) => debug!("overlay text uses renderer defaults: {err:#}"),
    }
    style
}

#[cfg(target_os = "macos")]
fn overlay_fallback_fonts() -> &'static [&'static str] {
    &["Helvetica", "Arial", "sans-serif"]
}

#[cfg(target_os = "windows")]
fn overlay_fallback_fonts() -> &'static [&'static str] {
    &["Arial", "Segoe UI", "sans-serif"]
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn overlay_fallback_fonts() -> &'static [&'static str] {
    &["DejaVu Sans", "Liberation Sans", "NotoSans", "sans-serif"]
}

/// One line per page plus a totals line.
pub fn format_report(report: &DocumentReport) -> String {
    let mut lines = Vec::new();
    for page in &report.pages {
        let mut line = format!(
            "page {}: {}/{} spans replaced, {}/{} images",
            page.page, page.inserted, page.tasks, page.images_replaced, page.images_found
        );
        if page.point_fallbacks > 0 {
            line.push_str(&format!(", {} point fallbacks", page.point_fallbacks));
        }
        if let Some(error) = &page.error {
            line.push_str(&format!(" (failed: {})", error));
        }
        lines.push(line);
    }
    let totals = &report.totals;
    lines.push(format!(
        "total: {} pages, {}/{} spans replaced, {}/{} images, {} failed pages",
        totals.pages,
        totals.inserted,
        totals.tasks,
        totals.images_replaced,
        totals.images_found,
        totals.failed_pages
    ));
    if report.cancelled {
        lines.push("stopped early: deadline reached".to_string());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ReportTotals;

    #[test]
    fn report_lists_pages_and_totals() {
        let report = DocumentReport {
            pages: vec![
                PageReport {
                    page: 1,
                    images_found: 1,
                    images_replaced: 1,
                    spans_found: 12,
                    tasks: 9,
                    inserted: 9,
                    point_fallbacks: 2,
                    error: None,
                },
                PageReport {
                    page: 2,
                    error: Some("failed to parse page content".to_string()),
                    ..PageReport::default()
                },
            ],
            totals: ReportTotals {
                pages: 2,
                failed_pages: 1,
                images_found: 1,
                images_replaced: 1,
                spans_found: 12,
                tasks: 9,
                inserted: 9,
                point_fallbacks: 2,
            },
            cancelled: true,
        };
        insta::assert_snapshot!(format_report(&report), @r"
        page 1: 9/9 spans replaced, 1/1 images, 2 point fallbacks
        page 2: 0/0 spans replaced, 0/0 images (failed: failed to parse page content)
        total: 2 pages, 9/9 spans replaced, 1/1 images, 1 failed pages
        stopped early: deadline reached
        ");
    }

    #[tokio::test]
    async fn missing_input_fails_before_anything_else() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            input: dir.path().join("missing.pdf"),
            output: dir.path().join("out.pdf"),
            ..Config::default()
        };
        let err = run(config).await.unwrap_err();
        assert!(err.to_string().contains("input file not found"));
    }
}
