use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use layout_translator::ImageMode;

#[derive(Parser, Debug)]
#[command(
    name = "layout-translator",
    version,
    about = "Translate PDF text in place, keeping the page layout"
)]
struct Cli {
    /// PDF to translate
    input: PathBuf,

    /// Where to write the translated PDF
    output: PathBuf,

    /// Target language (default from settings: Spanish)
    #[arg(short = 'l', long = "lang")]
    lang: Option<String>,

    /// Model or Azure deployment name
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// API key (overrides OPENAI_API_KEY / AZURE_OPENAI_KEY)
    #[arg(short = 'k', long = "key")]
    key: Option<String>,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<PathBuf>,

    /// How translated image text is written back (overlay, redact-and-draw)
    #[arg(long = "image-mode")]
    image_mode: Option<ImageMode>,

    /// Leave embedded images untouched
    #[arg(long = "no-images")]
    no_images: bool,

    /// Fill erased text with the sampled page background instead of white
    #[arg(long = "preserve-background")]
    preserve_background: bool,

    /// Shrink translated text until it fits the original box
    #[arg(long = "shrink-to-fit")]
    shrink_to_fit: bool,

    /// Span translations in flight per page
    #[arg(long = "concurrency")]
    concurrency: Option<usize>,

    /// Stop starting new pages after this many seconds; finished pages are still saved
    #[arg(long = "deadline-secs")]
    deadline_secs: Option<u64>,

    /// Tesseract languages for image text (e.g. eng or eng+spa)
    #[arg(long = "ocr-lang")]
    ocr_lang: Option<String>,

    /// Write every composited image to this directory
    #[arg(long = "debug-images")]
    debug_images: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    layout_translator::logging::init(cli.verbose)?;

    let report = layout_translator::run(layout_translator::Config {
        input: cli.input,
        output: cli.output,
        lang: cli.lang,
        model: cli.model,
        key: cli.key,
        settings_path: cli.read_settings,
        image_mode: cli.image_mode,
        no_images: cli.no_images,
        preserve_background: cli.preserve_background,
        shrink_to_fit: cli.shrink_to_fit,
        concurrency: cli.concurrency,
        deadline_secs: cli.deadline_secs,
        ocr_lang: cli.ocr_lang,
        debug_images: cli.debug_images,
    })
    .await?;

    println!("{}", layout_translator::format_report(&report));
    Ok(())
}
