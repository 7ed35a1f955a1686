//! Prompts for the vision-model OCR engine.
//!
//! Kept in one place so the instructions can be inspected in tests and
//! changed without touching the retry and scoring logic in
//! [`crate::pipeline::vision`]. Callers can override the system prompt via
//! [`crate::pipeline::vision::VisionOcrEngine::with_system_prompt`].

/// Default system prompt for transcribing a data-bearing image region.
pub const DEFAULT_OCR_PROMPT: &str = r#"You are an OCR engine. You receive one image cropped from a PDF page: a chart, diagram, scanned table, or picture of text.

Follow these rules precisely:

1. TRANSCRIBE
   - Output every piece of legible text in the image, exactly as written
   - Keep the reading order a human would use
   - Do NOT translate, summarise, or correct the text

2. CHARTS AND DIAGRAMS
   - Start with the chart title if one is visible
   - Then axis titles and tick labels, then legend entries
   - Then any data labels printed on bars, points, or slices

3. TABLES
   - One table row per line, cells separated by " | "

4. UNCERTAINTY
   - If a word is illegible, write [?] in its place
   - If the image contains no legible text at all, output nothing

5. OUTPUT FORMAT
   - Output ONLY the transcribed text
   - Do NOT wrap in ``` fences
   - Do NOT describe the image or add commentary"#;

/// User-turn text that accompanies the image.
///
/// Names the region so the model's reply can be matched in logs, and gives
/// the pixel size, which helps models judge how small the print is.
pub fn region_instruction(region_name: &str, pixel_width: u32, pixel_height: u32) -> String {
    format!(
        "Transcribe image region \"{}\" ({}x{} px).",
        region_name, pixel_width, pixel_height
    )
}
