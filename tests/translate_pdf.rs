mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{StaticRecognizer, TableProvider, operations, shown_strings, write_pdf};
use layout_translator::cache::TranslationCache;
use layout_translator::providers::retry::RetryPolicy;
use layout_translator::{
    ImageMode, ImageOptions, PdfDocument, PipelineOptions, PolicyConfig, Recognizer, Services,
    TranslationPolicy, translate_document,
};

const BENEFITS: &str = "BT /F1 14 Tf 40 740 Td (Copay) Tj ET \
                        BT /F1 10 Tf 40 700 Td (H5619136002) Tj ET \
                        BT /F1 10 Tf 40 660 Td ($35) Tj ET \
                        BT /F1 10 Tf 40 620 Td (Your dental benefit) Tj ET";

fn services(provider: TableProvider, recognizer: Option<&'static str>) -> Services<TableProvider> {
    let config = PolicyConfig {
        retry: RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        ..PolicyConfig::default()
    };
    let policy = TranslationPolicy::new(provider, config, Arc::new(TranslationCache::new())).unwrap();
    let recognizer =
        recognizer.map(|text| Box::new(StaticRecognizer(text)) as Box<dyn Recognizer>);
    Services::new(policy, recognizer)
}

#[tokio::test]
async fn translates_text_and_keeps_codes() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("benefits.pdf");
    let output = dir.path().join("benefits.es.pdf");
    write_pdf(&input, &[BENEFITS], false);

    let provider = TableProvider::new(&[("Your dental benefit", "Su beneficio dental")]);
    let services = services(provider.clone(), None);
    let report =
        translate_document::<PdfDocument, _>(&input, &output, &services, &PipelineOptions::default())
            .await
            .unwrap();

    assert_eq!(report.totals.pages, 1);
    assert_eq!(report.totals.failed_pages, 0);
    assert_eq!(report.totals.spans_found, 4);
    assert_eq!(report.totals.tasks, 2);
    assert_eq!(report.totals.inserted, 2);
    // "Copay" comes from the glossary, codes and amounts never reach the backend.
    assert_eq!(provider.seen(), vec!["Your dental benefit".to_string()]);

    let shown = shown_strings(&output, 1);
    assert!(shown.contains(&"copago".to_string()));
    assert!(shown.contains(&"H5619136002".to_string()));
    assert!(shown.contains(&"$35".to_string()));
    assert!(!shown.contains(&"Copay".to_string()));
    assert!(!shown.contains(&"Your dental benefit".to_string()));
    assert!(shown.iter().any(|text| text.contains("beneficio")));
}

#[tokio::test]
async fn backend_failures_keep_the_original_text() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pdf");
    let output = dir.path().join("out.pdf");
    write_pdf(&input, &[BENEFITS], false);

    let provider = TableProvider::default();
    let services = services(provider.clone(), None);
    let report =
        translate_document::<PdfDocument, _>(&input, &output, &services, &PipelineOptions::default())
            .await
            .unwrap();

    assert_eq!(provider.calls(), 1);
    assert_eq!(report.totals.tasks, 1);
    assert_eq!(report.totals.failed_pages, 0);
    let shown = shown_strings(&output, 1);
    assert!(shown.contains(&"Your dental benefit".to_string()));
    assert!(shown.contains(&"copago".to_string()));
}

#[tokio::test]
async fn images_without_text_stay_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pdf");
    let output = dir.path().join("out.pdf");
    let page = format!("q 80 0 0 40 40 400 cm /Im1 Do Q {BENEFITS}");
    write_pdf(&input, &[&page], true);

    let provider = TableProvider::new(&[("Your dental benefit", "Su beneficio dental")]);
    let services = services(provider, Some(""));
    let report =
        translate_document::<PdfDocument, _>(&input, &output, &services, &PipelineOptions::default())
            .await
            .unwrap();

    assert_eq!(report.totals.images_found, 1);
    assert_eq!(report.totals.images_replaced, 0);

    let saved = lopdf::Document::load(&output).unwrap();
    let image = saved
        .objects
        .values()
        .filter_map(|object| object.as_stream().ok())
        .find(|stream| {
            stream
                .dict
                .get(b"Subtype")
                .and_then(|subtype| subtype.as_name())
                .is_ok_and(|name| name == b"Image")
        })
        .unwrap();
    assert_eq!(image.dict.get(b"Width").unwrap().as_i64().unwrap(), 4);
    let pixels = image.decompressed_content().unwrap_or_else(|_| image.content.clone());
    assert_eq!(pixels, vec![0x80; 8]);

    let draws: Vec<_> = operations(&output, 1)
        .into_iter()
        .filter(|op| op.operator == "Do")
        .collect();
    assert_eq!(draws.len(), 1);
}

#[tokio::test]
async fn every_page_is_reported_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pdf");
    let output = dir.path().join("out.pdf");
    write_pdf(
        &input,
        &[
            "BT /F1 12 Tf 40 740 Td (Deductible) Tj ET",
            "BT /F1 12 Tf 40 740 Td (12345) Tj ET",
            "BT /F1 12 Tf 40 740 Td (Premium) Tj ET",
        ],
        false,
    );

    let provider = TableProvider::default();
    let services = services(provider.clone(), None);
    let options = PipelineOptions {
        concurrency: 3,
        ..PipelineOptions::default()
    };
    let report = translate_document::<PdfDocument, _>(&input, &output, &services, &options)
        .await
        .unwrap();

    let pages: Vec<usize> = report.pages.iter().map(|page| page.page).collect();
    assert_eq!(pages, vec![1, 2, 3]);
    let inserted: Vec<usize> = report.pages.iter().map(|page| page.inserted).collect();
    assert_eq!(inserted, vec![1, 0, 1]);
    assert_eq!(provider.calls(), 0);
    let first = shown_strings(&output, 1);
    assert!(first.contains(&"deducible".to_string()));
    assert!(!first.contains(&"Deductible".to_string()));
    assert_eq!(shown_strings(&output, 2), vec!["12345".to_string()]);
    assert!(shown_strings(&output, 3).contains(&"prima".to_string()));
}

#[tokio::test]
async fn second_pass_leaves_translated_output_alone() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pdf");
    let first = dir.path().join("first.pdf");
    let second = dir.path().join("second.pdf");
    write_pdf(&input, &[BENEFITS], false);

    let provider = TableProvider::new(&[("Your dental benefit", "Su beneficio dental")]);
    let services = services(provider.clone(), None);
    let options = PipelineOptions::default();
    let report = translate_document::<PdfDocument, _>(&input, &first, &services, &options)
        .await
        .unwrap();
    assert_eq!(report.totals.tasks, 2);
    let calls = provider.calls();

    let again = translate_document::<PdfDocument, _>(&first, &second, &services, &options)
        .await
        .unwrap();
    assert_eq!(again.totals.tasks, 0);
    assert_eq!(again.totals.inserted, 0);
    assert_eq!(provider.calls(), calls);
    assert_eq!(shown_strings(&second, 1), shown_strings(&first, 1));
}

#[tokio::test]
async fn shared_images_are_only_handled_where_drawn() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pdf");
    let output = dir.path().join("out.pdf");
    write_pdf(
        &input,
        &[
            "q 160 0 0 80 40 400 cm /Im1 Do Q",
            "BT /F1 12 Tf 40 740 Td (12345) Tj ET",
        ],
        true,
    );

    let provider = TableProvider::new(&[("Monthly premium", "Prima mensual")]);
    let services = services(provider, Some("Monthly premium"));
    let options = PipelineOptions {
        images: ImageOptions {
            mode: ImageMode::RedactAndDraw,
            ..ImageOptions::default()
        },
        ..PipelineOptions::default()
    };
    let report = translate_document::<PdfDocument, _>(&input, &output, &services, &options)
        .await
        .unwrap();

    assert_eq!((report.pages[0].images_found, report.pages[0].images_replaced), (1, 1));
    assert_eq!((report.pages[1].images_found, report.pages[1].images_replaced), (0, 0));
    assert!(shown_strings(&output, 1).iter().any(|text| text.contains("Prima")));
    assert_eq!(shown_strings(&output, 2), vec!["12345".to_string()]);
}

#[tokio::test]
async fn overlay_rewrites_a_reused_image_once() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pdf");
    let output = dir.path().join("out.pdf");
    let page = "q 160 0 0 80 40 400 cm /Im1 Do Q";
    write_pdf(&input, &[page, page], true);

    let provider = TableProvider::new(&[("Monthly premium", "Prima mensual")]);
    let services = services(provider.clone(), Some("Monthly premium"));
    let report =
        translate_document::<PdfDocument, _>(&input, &output, &services, &PipelineOptions::default())
            .await
            .unwrap();

    assert_eq!((report.pages[0].images_found, report.pages[0].images_replaced), (1, 1));
    assert_eq!((report.pages[1].images_found, report.pages[1].images_replaced), (0, 0));
    assert_eq!(provider.calls(), 1);
    assert_eq!(services.images.len(), 1);
}
