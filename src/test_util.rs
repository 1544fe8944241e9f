use anyhow::{Result, anyhow};
use image::DynamicImage;
use lopdf::{Dictionary, Object, ObjectId, Stream, dictionary};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::document::PdfDocument;
use crate::ocr::Recognizer;
use crate::providers::{Provider, ProviderFuture, ProviderResponse, ProviderUsage, ToolSpec};

/// Replays canned replies in order; `Err` entries simulate backend failures.
/// Once the script runs out every call fails.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedProvider {
    replies: Arc<Mutex<VecDeque<Result<String, String>>>>,
    calls: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<String>>>,
    system: Arc<Mutex<Vec<String>>>,
    last_user_input: Option<String>,
}

impl ScriptedProvider {
    pub(crate) fn new(replies: Vec<Result<&str, &str>>) -> Self {
        let replies = replies
            .into_iter()
            .map(|reply| reply.map(str::to_string).map_err(str::to_string))
            .collect();
        Self {
            replies: Arc::new(Mutex::new(replies)),
            ..Default::default()
        }
    }

    pub(crate) fn replying(reply: &str, times: usize) -> Self {
        Self::new(vec![Ok(reply); times])
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn inputs(&self) -> Vec<String> {
        self.inputs.lock().expect("inputs lock").clone()
    }

    pub(crate) fn system_prompts(&self) -> Vec<String> {
        self.system.lock().expect("system lock").clone()
    }
}

impl Provider for ScriptedProvider {
    fn append_system_input(self, input: String) -> Self {
        self.system.lock().expect("system lock").push(input);
        self
    }

    fn append_user_input(mut self, input: String) -> Self {
        self.last_user_input = Some(input);
        self
    }

    fn register_tool(self, _tool: ToolSpec) -> Self {
        self
    }

    fn call_tool(self, _tool_name: &str) -> ProviderFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(input) = &self.last_user_input {
            self.inputs.lock().expect("inputs lock").push(input.clone());
        }
        let reply = self.replies.lock().expect("replies lock").pop_front();
        Box::pin(async move {
            match reply {
                Some(Ok(translation)) => Ok(ProviderResponse {
                    args: json!({ "translation": translation }),
                    model: Some("scripted".to_string()),
                    usage: Some(ProviderUsage {
                        prompt_tokens: Some(10),
                        completion_tokens: Some(2),
                        total_tokens: Some(12),
                    }),
                }),
                Some(Err(message)) => Err(anyhow!(message)),
                None => Err(anyhow!("script exhausted")),
            }
        })
    }
}

/// Returns the same text for every image and counts calls.
#[derive(Debug, Default)]
pub(crate) struct FixedRecognizer {
    text: String,
    calls: AtomicUsize,
}

impl FixedRecognizer {
    pub(crate) fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Recognizer for FixedRecognizer {
    fn recognize(&self, _image: &DynamicImage) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.text.clone())
    }
}

/// Builds a single 612x792 page with Helvetica as `/F1`. `xobjects` adds objects to the
/// document and returns the page's XObject resource dictionary.
pub(crate) fn one_page_pdf(
    content: &str,
    xobjects: impl FnOnce(&mut lopdf::Document) -> Dictionary,
) -> PdfDocument {
    let mut doc = lopdf::Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let xobjects = xobjects(&mut doc);
    let content_id = doc.add_object(Stream::new(Dictionary::new(), content.as_bytes().to_vec()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        "Contents" => content_id,
        "Resources" => dictionary! {
            "Font" => dictionary! { "F1" => font_id },
            "XObject" => xobjects,
        },
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::from(page_id)],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("serialize test pdf");
    PdfDocument::from_bytes(&bytes).expect("reload test pdf")
}

/// Adds an uncompressed DeviceRGB image of one solid color.
pub(crate) fn solid_rgb_image(doc: &mut lopdf::Document, width: u32, height: u32, rgb: [u8; 3]) -> ObjectId {
    let samples = rgb.repeat(width as usize * height as usize);
    doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
        },
        samples,
    ))
}
