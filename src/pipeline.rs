//! Page orchestration and the document driver.

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::background::{PageRaster, contrast_color};
use crate::cache::TranslationCache;
use crate::document::{Document, PageSurface};
use crate::image_text::{ImageLedger, ImageOptions, ImagePipeline};
use crate::ocr::Recognizer;
use crate::policy::TranslationPolicy;
use crate::providers::Provider;
use crate::redaction::{FillSource, plan_regions};
use crate::reinsert::{InsertOutcome, ReinsertOptions, reinsert};
use crate::span::{Rgb, TranslationTask};

pub const DEFAULT_BACKGROUND_ZOOM: f32 = 2.0;

#[derive(Clone)]
pub struct PipelineOptions {
    /// Fill erased regions with the sampled page background instead of white.
    pub preserve_background: bool,
    pub background_zoom: f32,
    pub shrink_to_fit: bool,
    pub translate_images: bool,
    /// Span translations in flight per page.
    pub concurrency: usize,
    /// No new page starts once this much time has passed.
    pub deadline: Option<Duration>,
    pub images: ImageOptions,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            preserve_background: false,
            background_zoom: DEFAULT_BACKGROUND_ZOOM,
            shrink_to_fit: false,
            translate_images: true,
            concurrency: 1,
            deadline: None,
            images: ImageOptions::default(),
        }
    }
}

/// Long-lived collaborators shared by every page.
pub struct Services<P> {
    pub policy: TranslationPolicy<P>,
    /// `None` disables the image pipeline.
    pub recognizer: Option<Box<dyn Recognizer>>,
    pub images: ImageLedger,
}

impl<P: Provider> Services<P> {
    pub fn new(policy: TranslationPolicy<P>, recognizer: Option<Box<dyn Recognizer>>) -> Self {
        Self {
            policy,
            recognizer,
            images: ImageLedger::new(),
        }
    }

    pub fn cache(&self) -> &Arc<TranslationCache> {
        self.policy.cache()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageReport {
    pub page: usize,
    pub images_found: usize,
    pub images_replaced: usize,
    pub spans_found: usize,
    pub tasks: usize,
    pub inserted: usize,
    pub point_fallbacks: usize,
    pub error: Option<String>,
}

impl PageReport {
    fn new(page: usize) -> Self {
        Self {
            page,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportTotals {
    pub pages: usize,
    pub failed_pages: usize,
    pub images_found: usize,
    pub images_replaced: usize,
    pub spans_found: usize,
    pub tasks: usize,
    pub inserted: usize,
    pub point_fallbacks: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DocumentReport {
    pub pages: Vec<PageReport>,
    pub totals: ReportTotals,
    /// The deadline passed before every page was processed.
    pub cancelled: bool,
}

impl DocumentReport {
    fn push(&mut self, page: PageReport) {
        let totals = &mut self.totals;
        totals.pages += 1;
        totals.failed_pages += usize::from(page.error.is_some());
        totals.images_found += page.images_found;
        totals.images_replaced += page.images_replaced;
        totals.spans_found += page.spans_found;
        totals.tasks += page.tasks;
        totals.inserted += page.inserted;
        totals.point_fallbacks += page.point_fallbacks;
        self.pages.push(page);
    }
}

/// Images first, then spans: translate, erase every region in one batch, redraw.
///
/// Counters in `report` reflect whatever finished before an error.
pub async fn process_page<S, P>(
    page: &mut S,
    services: &Services<P>,
    options: &PipelineOptions,
    report: &mut PageReport,
) -> Result<()>
where
    S: PageSurface + ?Sized,
    P: Provider,
{
    if options.translate_images
        && let Some(recognizer) = services.recognizer.as_deref()
    {
        let outcomes = ImagePipeline::new(&services.policy, recognizer, &options.images)
            .with_ledger(&services.images)
            .run(page)
            .await?;
        report.images_found = outcomes.len();
        report.images_replaced = outcomes.iter().filter(|outcome| outcome.is_replaced()).count();
    }

    let spans = page.spans()?;
    report.spans_found = spans.len();
    let policy = &services.policy;
    let translations: Vec<String> = stream::iter(spans.iter().map(|span| policy.translate(&span.text)))
        .buffered(options.concurrency.max(1))
        .collect()
        .await;
    let tasks: Vec<TranslationTask> = spans
        .iter()
        .zip(translations)
        .filter_map(|(span, translated)| TranslationTask::from_span(span, translated))
        .collect();
    report.tasks = tasks.len();
    if tasks.is_empty() {
        debug!(page = page.number(), spans = spans.len(), "nothing to translate on page");
        return Ok(());
    }

    let raster = if options.preserve_background {
        render_background(&*page, options.background_zoom)
    } else {
        None
    };
    let fill = if options.preserve_background {
        FillSource::Sampled(raster.as_ref())
    } else {
        FillSource::Solid(Rgb::WHITE)
    };
    let regions = plan_regions(&tasks, fill);
    page.apply_redactions(&regions)
        .with_context(|| format!("failed to erase text on page {}", page.number()))?;

    let reinsert_options = ReinsertOptions {
        shrink_to_fit: options.shrink_to_fit,
    };
    for (task, region) in tasks.iter().zip(&regions) {
        let background = region.fill.unwrap_or(Rgb::WHITE);
        let color = contrast_color(task.font.color, background);
        let outcome = reinsert(page, task, color, reinsert_options);
        if outcome.is_success() {
            report.inserted += 1;
        }
        if outcome == InsertOutcome::PointFallback {
            report.point_fallbacks += 1;
        }
    }
    Ok(())
}

fn render_background<S: PageSurface + ?Sized>(page: &S, zoom: f32) -> Option<PageRaster> {
    match page.render(zoom) {
        Ok(raster) => Some(raster),
        Err(err) => {
            warn!(page = page.number(), "page render failed, erasing with white: {err:#}");
            None
        }
    }
}

/// Opens `input`, runs every page in order and saves to `output`.
///
/// Only open and save failures are returned; page failures land in the report.
pub async fn translate_document<D, P>(
    input: &Path,
    output: &Path,
    services: &Services<P>,
    options: &PipelineOptions,
) -> Result<DocumentReport>
where
    D: Document,
    P: Provider,
{
    let mut document = D::open(input)?;
    let started = Instant::now();
    let mut report = DocumentReport::default();
    let page_count = document.page_count();

    for number in 1..=page_count {
        if let Some(deadline) = options.deadline
            && started.elapsed() >= deadline
        {
            warn!(
                processed = number - 1,
                remaining = page_count + 1 - number,
                "deadline reached, saving processed pages"
            );
            report.cancelled = true;
            break;
        }

        let mut page_report = PageReport::new(number);
        let result = match document.page(number) {
            Ok(mut page) => process_page(&mut page, services, options, &mut page_report).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => info!(
                page = number,
                tasks = page_report.tasks,
                inserted = page_report.inserted,
                images = page_report.images_replaced,
                "page done"
            ),
            Err(err) => {
                warn!(page = number, "page failed: {err:#}");
                page_report.error = Some(format!("{err:#}"));
            }
        }
        report.push(page_report);
    }

    document.save(output)?;
    info!(
        pages = report.totals.pages,
        inserted = report.totals.inserted,
        cached = services.cache().len(),
        cancelled = report.cancelled,
        "document saved"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::PdfDocument;
    use crate::policy::PolicyConfig;
    use crate::providers::retry::RetryPolicy;
    use crate::span::Rect;
    use crate::test_util::{FixedRecognizer, ScriptedProvider, one_page_pdf};
    use lopdf::Dictionary;
    use lopdf::content::Content;

    const PAGE: &str = "BT /F1 12 Tf 10 772 Td (Copay) Tj ET \
                        BT /F1 10 Tf 10 600 Td (H5619136002) Tj ET \
                        BT /F1 10 Tf 10 500 Td (Your dental benefit) Tj ET";

    fn services(provider: ScriptedProvider, recognizer: Option<&str>) -> Services<ScriptedProvider> {
        let config = PolicyConfig {
            retry: RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            ..PolicyConfig::default()
        };
        let policy = TranslationPolicy::new(provider, config, Arc::new(TranslationCache::new()))
            .expect("policy");
        let recognizer = recognizer.map(|text| Box::new(FixedRecognizer::new(text)) as Box<dyn Recognizer>);
        Services::new(policy, recognizer)
    }

    fn shown_strings(doc: &mut PdfDocument) -> Vec<String> {
        let bytes = doc.to_bytes().unwrap();
        let reopened = lopdf::Document::load_mem(&bytes).unwrap();
        let page_id = *reopened.get_pages().get(&1).unwrap();
        let content = Content::decode(&reopened.get_page_content(page_id).unwrap()).unwrap();
        content
            .operations
            .iter()
            .filter(|op| op.operator == "Tj")
            .filter_map(|op| match op.operands.first() {
                Some(lopdf::Object::String(bytes, _)) => Some(String::from_utf8_lossy(bytes).into_owned()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn page_text_is_replaced_in_place() {
        let provider = ScriptedProvider::replying("Su beneficio dental", 1);
        let services = services(provider.clone(), Some(""));
        let mut doc = one_page_pdf(PAGE, |_| Dictionary::new());
        let mut report = PageReport::new(1);
        {
            let mut page = doc.page(1).unwrap();
            process_page(&mut page, &services, &PipelineOptions::default(), &mut report)
                .await
                .unwrap();
            let remaining: Vec<String> = page.spans().unwrap().into_iter().map(|span| span.text).collect();
            assert_eq!(remaining, vec!["H5619136002"]);
        }

        assert_eq!(report.spans_found, 3);
        assert_eq!(report.tasks, 2);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.point_fallbacks, 0);
        assert_eq!(provider.calls(), 1);

        let shown = shown_strings(&mut doc);
        assert!(shown.contains(&"H5619136002".to_string()));
        assert!(shown.contains(&"copago".to_string()));
        assert!(!shown.contains(&"Copay".to_string()));
        assert!(shown.iter().any(|text| text.contains("beneficio")));
    }

    #[tokio::test]
    async fn concurrent_translation_keeps_span_order() {
        let provider = ScriptedProvider::new(vec![Ok("Uno dos tres"), Ok("Cuatro cinco seis")]);
        let services = services(provider, None);
        let mut doc = one_page_pdf(
            "BT /F1 12 Tf 10 700 Td (One two three) Tj ET BT /F1 12 Tf 10 600 Td (Four five six) Tj ET",
            |_| Dictionary::new(),
        );
        let options = PipelineOptions {
            concurrency: 4,
            ..PipelineOptions::default()
        };
        let mut report = PageReport::new(1);
        let mut page = doc.page(1).unwrap();
        process_page(&mut page, &services, &options, &mut report).await.unwrap();
        assert_eq!(report.tasks, 2);
        assert_eq!(report.inserted, 2);
    }

    #[tokio::test]
    async fn tiny_boxes_still_get_text() {
        let provider = ScriptedProvider::replying("Autorización previa requerida para todos los servicios", 1);
        let services = services(provider, None);
        let mut doc = one_page_pdf("BT /F1 6 Tf 10 700 Td (Prior auth) Tj ET", |_| Dictionary::new());
        let mut report = PageReport::new(1);
        let mut page = doc.page(1).unwrap();
        process_page(&mut page, &services, &PipelineOptions::default(), &mut report)
            .await
            .unwrap();
        assert_eq!(report.tasks, 1);
        assert_eq!(report.inserted, 1);
    }

    #[tokio::test]
    async fn document_round_trip_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("plan.pdf");
        let output = dir.path().join("plan.es.pdf");
        let mut source = one_page_pdf(PAGE, |_| Dictionary::new());
        std::fs::write(&input, source.to_bytes().unwrap()).unwrap();

        let services = services(ScriptedProvider::replying("Su beneficio dental", 1), Some(""));
        let report = translate_document::<PdfDocument, _>(&input, &output, &services, &PipelineOptions::default())
            .await
            .unwrap();

        insta::assert_json_snapshot!(report.totals, @r#"
        {
          "pages": 1,
          "failed_pages": 0,
          "images_found": 0,
          "images_replaced": 0,
          "spans_found": 3,
          "tasks": 2,
          "inserted": 2,
          "point_fallbacks": 0
        }
        "#);
        assert!(!report.cancelled);

        let mut translated = PdfDocument::open(&output).unwrap();
        let page = translated.page(1).unwrap();
        let spans = page.spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].bbox.x0, 10.0);
        assert!(Rect::new(0.0, 0.0, 612.0, 792.0).contains(&spans[0].bbox));
    }

    #[tokio::test]
    async fn expired_deadline_still_saves() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("plan.pdf");
        let output = dir.path().join("out.pdf");
        let mut source = one_page_pdf(PAGE, |_| Dictionary::new());
        std::fs::write(&input, source.to_bytes().unwrap()).unwrap();

        let provider = ScriptedProvider::replying("unused", 1);
        let services = services(provider.clone(), None);
        let options = PipelineOptions {
            deadline: Some(Duration::ZERO),
            ..PipelineOptions::default()
        };
        let report = translate_document::<PdfDocument, _>(&input, &output, &services, &options)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert!(report.pages.is_empty());
        assert_eq!(provider.calls(), 0);
        assert!(output.exists());
    }

    #[tokio::test]
    async fn missing_input_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(ScriptedProvider::default(), None);
        let result = translate_document::<PdfDocument, _>(
            &dir.path().join("missing.pdf"),
            &dir.path().join("out.pdf"),
            &services,
            &PipelineOptions::default(),
        )
        .await;
        assert!(result.is_err());
    }
}
