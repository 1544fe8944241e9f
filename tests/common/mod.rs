#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use image::DynamicImage;
use layout_translator::Recognizer;
use layout_translator::providers::{Provider, ProviderFuture, ProviderResponse, ToolSpec};
use lopdf::content::Content;
use lopdf::{Dictionary, Object, Stream, dictionary};
use serde_json::json;

/// Answers from a fixed table; unknown text comes back as a backend error.
#[derive(Clone, Default)]
pub struct TableProvider {
    replies: Arc<HashMap<String, String>>,
    seen: Arc<Mutex<Vec<String>>>,
    calls: Arc<AtomicUsize>,
    input: Option<String>,
}

impl TableProvider {
    pub fn new(replies: &[(&str, &str)]) -> Self {
        Self {
            replies: Arc::new(
                replies
                    .iter()
                    .map(|(source, target)| (source.to_string(), target.to_string()))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl Provider for TableProvider {
    fn append_system_input(self, _input: String) -> Self {
        self
    }

    fn append_user_input(mut self, input: String) -> Self {
        self.input = Some(input);
        self
    }

    fn register_tool(self, _tool: ToolSpec) -> Self {
        self
    }

    fn call_tool(self, _tool_name: &str) -> ProviderFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let input = self.input.clone().unwrap_or_default();
        self.seen.lock().unwrap().push(input.clone());
        let reply = self.replies.get(&input).cloned();
        Box::pin(async move {
            let translation = reply.ok_or_else(|| anyhow!("no reply for {input:?}"))?;
            Ok(ProviderResponse {
                args: json!({ "translation": translation }),
                model: Some("table".to_string()),
                usage: None,
            })
        })
    }
}

/// OCR stand-in that always reads the same text.
pub struct StaticRecognizer(pub &'static str);

impl Recognizer for StaticRecognizer {
    fn recognize(&self, _image: &DynamicImage) -> Result<String> {
        Ok(self.0.to_string())
    }
}

/// Letter-sized pages with Helvetica as /F1 and an optional 4x2 gray image as /Im1.
pub fn write_pdf(path: &Path, pages: &[&str], with_image: bool) {
    let mut doc = lopdf::Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let mut xobjects = Dictionary::new();
    if with_image {
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 4,
                "Height" => 2,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            vec![0x80; 8],
        ));
        xobjects.set("Im1", image_id);
    }
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
        "XObject" => xobjects,
    });

    let mut kids = Vec::new();
    for content in pages {
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content.as_bytes().to_vec()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
            "Resources" => resources_id,
        });
        kids.push(Object::from(page_id));
    }
    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.save(path).unwrap();
}

/// Strings shown with `Tj` on a page of a saved file.
pub fn shown_strings(path: &Path, page: u32) -> Vec<String> {
    operations(path, page)
        .into_iter()
        .filter(|op| op.operator == "Tj")
        .filter_map(|op| match op.operands.first() {
            Some(Object::String(bytes, _)) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        })
        .collect()
}

pub fn operations(path: &Path, page: u32) -> Vec<lopdf::content::Operation> {
    let doc = lopdf::Document::load(path).unwrap();
    let page_id = *doc.get_pages().get(&page).unwrap();
    Content::decode(&doc.get_page_content(page_id).unwrap())
        .unwrap()
        .operations
}
