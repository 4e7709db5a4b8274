pub mod aspect;
pub mod embedder;
pub mod event_bus;
pub mod job_manager;
pub mod pdf_convert;
pub mod planner;
pub mod rate_limit;
pub mod text_extract;
pub mod thumb_render;

pub use aspect::{detect_aspect_from_pptx, Aspect};
pub use embedder::{
    embed_text_batch, estimate_tokens, pack_f32, unpack_f32, zero_vector, EmbedApiError,
    ImageEmbedClient, OpenAiEmbedClient, TextEmbedClient,
};
pub use event_bus::{sse_format, Event, EventBus};
pub use job_manager::{JobError, JobManager};
pub use pdf_convert::{LibreOfficeConverter, PdfConvert, PdfConvertError};
pub use planner::{scan_files_under, scan_specific_files, slide_count, FileScan};
pub use rate_limit::{backoff_delay, backoff_delay_with, DualTokenBucket};
pub use text_extract::{
    extract_page_text, fast_text_sig, normalize_text, PageText, TextExtractError,
};
pub use thumb_render::{thumb_size, PdfiumThumbRenderer, ThumbRender, ThumbRenderError};
