//! Markdown assembly: the prompt-ready rendering of an [`ExtractionResult`].
//!
//! Running headers and footers and decorative images are left out; they are
//! noise in a prompt. Consecutive paragraph lines are joined into one
//! Markdown paragraph, tables become GFM tables, and images are rendered as a
//! short quoted note followed by any OCR text.

use crate::config::PageSeparator;
use crate::fragment::SemanticRole;
use crate::output::{DocumentMetadata, ExtractionResult, FusedContent, FusedItem};

impl ExtractionResult {
    /// Render the result as Markdown.
    ///
    /// * `separator` – inserted between pages that produced any output
    /// * `include_metadata` – prepend YAML front matter
    pub fn to_markdown(&self, separator: &PageSeparator, include_metadata: bool) -> String {
        let mut parts: Vec<String> = Vec::new();

        if include_metadata {
            parts.push(format_yaml_front_matter(&self.metadata, self.quality.overall_fidelity));
        }

        let mut rendered_pages = 0;
        for page in self.pages_with_items() {
            let body = render_page(self.items_on_page(page));
            if body.is_empty() {
                continue;
            }
            if rendered_pages > 0 {
                parts.push(separator.render(page + 1));
            }
            parts.push(body);
            rendered_pages += 1;
        }

        let mut out = parts.join("");
        if !out.ends_with('\n') && !out.is_empty() {
            out.push('\n');
        }
        out
    }
}

fn render_page<'a>(items: impl Iterator<Item = &'a FusedItem>) -> String {
    let mut blocks: Vec<String> = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();

    for item in items {
        if item.role.is_furniture() || item.role == SemanticRole::Decorative {
            continue;
        }
        if let (SemanticRole::Paragraph, Some(text)) = (item.role, item.text()) {
            paragraph.push(text.trim());
            continue;
        }
        if !paragraph.is_empty() {
            blocks.push(paragraph.join("\n"));
            paragraph.clear();
        }
        if let Some(block) = render_item(item) {
            blocks.push(block);
        }
    }
    if !paragraph.is_empty() {
        blocks.push(paragraph.join("\n"));
    }

    blocks.retain(|b| !b.trim().is_empty());
    blocks.join("\n\n")
}

fn render_item(item: &FusedItem) -> Option<String> {
    match &item.content {
        FusedContent::Text { text } => {
            let text = text.trim();
            Some(match item.role {
                SemanticRole::Heading => format!("## {}", text),
                SemanticRole::Caption => format!("*{}*", text),
                SemanticRole::Footnote => format!("<sub>{}</sub>", text),
                _ => text.to_string(),
            })
        }
        FusedContent::Table { rows, .. } => render_table(rows),
        FusedContent::Image {
            name,
            pixel_width,
            pixel_height,
            ocr,
        } => {
            let kind = match item.role {
                SemanticRole::Chart => "chart",
                SemanticRole::Photo => "photo",
                _ => "image",
            };
            let mut out = format!("> **Image** `{}` ({}, {}×{})", name, kind, pixel_width, pixel_height);
            if let Some(ocr) = ocr.as_ref().filter(|o| !o.text.trim().is_empty()) {
                out.push_str("\n>");
                for line in ocr.text.lines() {
                    out.push_str("\n> ");
                    out.push_str(line);
                }
            }
            Some(out)
        }
    }
}

/// GFM table; the first row is the header.
fn render_table(rows: &[Vec<String>]) -> Option<String> {
    let columns = rows.iter().map(Vec::len).max()?;
    if columns == 0 {
        return None;
    }
    let row_line = |row: &[String]| {
        let cells: Vec<String> = (0..columns)
            .map(|i| escape_cell(row.get(i).map(String::as_str).unwrap_or("")))
            .collect();
        format!("| {} |", cells.join(" | "))
    };

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(row_line(&rows[0]));
    lines.push(format!("|{}", " --- |".repeat(columns)));
    lines.extend(rows[1..].iter().map(|r| row_line(r)));
    Some(lines.join("\n"))
}

fn escape_cell(cell: &str) -> String {
    cell.trim().replace('|', "\\|").replace('\n', " ")
}

/// Format document metadata as YAML front matter.
fn format_yaml_front_matter(meta: &DocumentMetadata, fidelity: f32) -> String {
    let mut yaml = String::from("---\n");

    if let Some(ref t) = meta.title {
        yaml.push_str(&format!("title: \"{}\"\n", t.replace('"', "\\\"")));
    }
    if let Some(ref a) = meta.author {
        yaml.push_str(&format!("author: \"{}\"\n", a.replace('"', "\\\"")));
    }
    yaml.push_str(&format!("pages: {}\n", meta.page_count));
    if meta.pages_processed != meta.page_count {
        yaml.push_str(&format!("pages_processed: {}\n", meta.pages_processed));
    }
    if !meta.pdf_version.is_empty() {
        yaml.push_str(&format!("pdf_version: \"{}\"\n", meta.pdf_version));
    }
    yaml.push_str(&format!("fidelity: {:.2}\n", fidelity));

    yaml.push_str("---\n\n");
    yaml
}
