//! Pipeline stages for PDF extraction and fusion.
//!
//! Each submodule implements exactly one transformation step.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ split ──▶ extractors ──▶ classify ──▶ ocr ──▶ fusion ──▶ quality ──▶ aggregate
//! (path)   (lopdf)   (concurrent)   (roles)    (flagged)  (merge)   (scores)   (page order)
//! ```
//!
//! 1. [`input`]     - read a local path into memory and check the `%PDF` magic
//! 2. [`split`]     - lazy page handles; [`content`] interprets each page's
//!    content stream into glyph runs, image placements and ruling lines
//! 3. [`page`]      - per-page driver: extractor fan-out under timeouts, then
//!    the stages below
//! 4. [`classify`]  - semantic roles, reading order, OCR flags
//! 5. [`ocr`]       - OCR for data-bearing images only; [`vision`] is an
//!    engine backed by a vision LLM
//! 6. [`fusion`]    - merge overlapping fragments into fused items
//! 7. [`quality`]   - per-item floors, per-category scores, fallback flags
//! 8. [`aggregate`] - reorder buffer and document-level result
//!
//! [`cancel`], [`normalize`], [`encode`] and [`assemble`] are shared helpers.

pub mod aggregate;
pub mod assemble;
pub mod cancel;
pub mod classify;
pub mod content;
pub mod encode;
pub mod fusion;
pub mod input;
pub mod normalize;
pub mod ocr;
pub mod page;
pub mod quality;
pub mod split;
pub mod vision;
