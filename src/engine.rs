//! The byte-level document engine seam.
//!
//! Workers never manipulate documents themselves; they hand each request to
//! a [`DocumentEngine`]. Engines run on blocking threads and report progress
//! through the supplied callback.

use bytes::{Bytes, BytesMut};

use crate::error::{names, RawError};
use crate::worker::{Operation, WorkOutput, WorkPayload};

pub trait DocumentEngine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn run(
        &self,
        operation: Operation,
        payload: &WorkPayload,
        progress: &mut dyn FnMut(u8),
    ) -> Result<WorkOutput, RawError>;
}

const PDF_MAGIC: &[u8] = b"%PDF-";
const PDF_TRAILER: &[u8] = b"%%EOF";

/// Structural checks only: validates headers, concatenates merge inputs and
/// returns compress inputs untouched. Stands in until a real document
/// library is plugged in.
#[derive(Debug, Default, Clone)]
pub struct PassthroughEngine;

impl PassthroughEngine {
    fn inspect(&self, index: usize, buffer: &[u8], warnings: &mut Vec<String>) -> Result<u32, RawError> {
        if !buffer.starts_with(PDF_MAGIC) {
            return Err(RawError::named(
                names::VALIDATION,
                format!("document {index} is missing the %PDF- header"),
            ));
        }
        let tail_start = buffer.len().saturating_sub(1024);
        if find(&buffer[tail_start..], PDF_TRAILER).is_none() {
            warnings.push(format!("document {index} has no %%EOF trailer"));
        }
        Ok(count_pages(buffer))
    }
}

impl DocumentEngine for PassthroughEngine {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn run(
        &self,
        operation: Operation,
        payload: &WorkPayload,
        progress: &mut dyn FnMut(u8),
    ) -> Result<WorkOutput, RawError> {
        let total = payload.buffers.len();
        if total == 0 {
            return Err(RawError::named(names::VALIDATION, "no input documents"));
        }
        if operation == Operation::Merge && total < 2 {
            return Err(RawError::named(
                names::VALIDATION,
                "merge needs at least two documents",
            ));
        }

        let mut warnings = Vec::new();
        let mut pages = 0;
        let data = match operation {
            Operation::Validate => {
                pages = self.inspect(0, &payload.buffers[0], &mut warnings)?;
                progress(100);
                payload.buffers[0].clone()
            }
            Operation::Merge => {
                let mut merged = BytesMut::with_capacity(payload.buffers.iter().map(Bytes::len).sum());
                for (index, buffer) in payload.buffers.iter().enumerate() {
                    pages += self.inspect(index, buffer, &mut warnings)?;
                    merged.extend_from_slice(buffer);
                    progress((((index + 1) * 100) / total) as u8);
                }
                merged.freeze()
            }
            // Chunks of a streamed file carry no header, so they are not inspected.
            Operation::Compress => {
                let mut out = BytesMut::with_capacity(payload.buffers.iter().map(Bytes::len).sum());
                for (index, buffer) in payload.buffers.iter().enumerate() {
                    pages += count_pages(buffer);
                    out.extend_from_slice(buffer);
                    progress((((index + 1) * 100) / total) as u8);
                }
                warnings.push("no compressor configured; output is unchanged".to_string());
                out.freeze()
            }
        };

        Ok(WorkOutput {
            data,
            pages_processed: pages,
            warnings,
            engine: self.name().to_string(),
        })
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    haystack
        .windows(needle.len())
        .filter(|window| *window == needle)
        .count()
}

/// Counts `/Type /Page` objects, excluding the `/Type /Pages` tree nodes.
pub fn count_pages(buffer: &[u8]) -> u32 {
    let objects = count_occurrences(buffer, b"/Type /Page");
    let trees = count_occurrences(buffer, b"/Type /Pages");
    objects.saturating_sub(trees) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProcessingOptions;

    fn pdf(pages: usize) -> Bytes {
        let mut doc = b"%PDF-1.7\n1 0 obj << /Type /Pages >> endobj\n".to_vec();
        for _ in 0..pages {
            doc.extend_from_slice(b"2 0 obj << /Type /Page >> endobj\n");
        }
        doc.extend_from_slice(b"%%EOF\n");
        Bytes::from(doc)
    }

    fn payload(buffers: Vec<Bytes>) -> WorkPayload {
        WorkPayload {
            buffers,
            options: ProcessingOptions::default(),
        }
    }

    #[test]
    fn validate_counts_pages() {
        let mut seen = Vec::new();
        let out = PassthroughEngine
            .run(Operation::Validate, &payload(vec![pdf(3)]), &mut |p| seen.push(p))
            .unwrap();
        assert_eq!(out.pages_processed, 3);
        assert!(out.warnings.is_empty());
        assert_eq!(seen, vec![100]);
    }

    #[test]
    fn validate_rejects_non_pdf() {
        let err = PassthroughEngine
            .run(Operation::Validate, &payload(vec![Bytes::from_static(b"hello")]), &mut |_| {})
            .unwrap_err();
        assert_eq!(err.name.as_deref(), Some(names::VALIDATION));
    }

    #[test]
    fn merge_reports_per_document_progress() {
        let mut seen = Vec::new();
        let out = PassthroughEngine
            .run(Operation::Merge, &payload(vec![pdf(1), pdf(2)]), &mut |p| seen.push(p))
            .unwrap();
        assert_eq!(out.pages_processed, 3);
        assert_eq!(seen, vec![50, 100]);
        assert_eq!(out.data.len(), pdf(1).len() + pdf(2).len());
    }

    #[test]
    fn merge_needs_two_documents() {
        assert!(PassthroughEngine
            .run(Operation::Merge, &payload(vec![pdf(1)]), &mut |_| {})
            .is_err());
    }
}
