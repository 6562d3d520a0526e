use crate::config::RewriteConfig;
use crate::engine::CompressionEngine;
use crate::error::{CompressionError, Result};
use crate::pdf::encode::{deflate_best, inflate};
use crate::pdf::graph::{DictExt, FilterKind};
use crate::pdf::transform::{recompress_images, ImageOptions, TransformReport};
use lopdf::{Document, Object, SaveOptions};
use std::fs;
use std::path::Path;
use tracing::{debug, instrument};

/// In-process rewrite of the document's object graph with lopdf.
pub struct RewriteEngine {
    quality: u8,
    settings: RewriteConfig,
}

/// What one rewrite pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteReport {
    pub pruned_objects: usize,
    pub empty_streams_removed: usize,
    pub streams_recompressed: usize,
    pub images: TransformReport,
}

impl RewriteEngine {
    pub fn new(quality: u8, settings: RewriteConfig) -> Self {
        Self { quality, settings }
    }

    /// Load `bytes`, refusing encrypted documents.
    pub fn load(bytes: &[u8]) -> Result<Document> {
        if declares_encryption(bytes) {
            return Err(CompressionError::PasswordProtected(
                "document declares an /Encrypt dictionary".to_string(),
            ));
        }
        let doc = Document::load_mem(bytes).map_err(|e| classify_load_error(&e.to_string()))?;
        if doc.trailer.has(b"Encrypt") {
            return Err(CompressionError::PasswordProtected(
                "document is encrypted".to_string(),
            ));
        }
        Ok(doc)
    }

    pub fn optimize(&self, doc: &mut Document) -> RewriteReport {
        let mut report = RewriteReport::default();

        if self.settings.remove_unreferenced {
            report.pruned_objects += doc.prune_objects().len();
        }
        if self.settings.recompress_images {
            let options = ImageOptions {
                quality: self.quality,
                zopfli: self.settings.zopfli,
            };
            report.images = recompress_images(doc, &options);
        }
        report.empty_streams_removed = doc.delete_zero_length_streams().len();
        if self.settings.recompress_streams {
            report.streams_recompressed = recompress_flate_streams(doc);
        }

        doc.compress();
        doc.renumber_objects();
        report
    }
}

impl CompressionEngine for RewriteEngine {
    fn name(&self) -> &'static str {
        "rewrite"
    }

    #[instrument(skip_all, fields(file = %input.display()))]
    fn compress(&self, input: &Path, output: &Path) -> Result<()> {
        let bytes = fs::read(input)?;
        let mut doc = Self::load(&bytes)?;

        let report = self.optimize(&mut doc);
        debug!(
            pruned = report.pruned_objects,
            empty_streams = report.empty_streams_removed,
            streams = report.streams_recompressed,
            images = report.images.rewritten(),
            image_bytes_saved = report.images.bytes_saved(),
            "Rewrite pass done"
        );

        fs::write(output, serialize_smallest(&mut doc)?)?;
        Ok(())
    }
}

/// Serialize with a classic xref table and with object streams, keeping the smaller.
fn serialize_smallest(doc: &mut Document) -> Result<Vec<u8>> {
    let mut classic = Vec::new();
    doc.save_to(&mut classic)
        .map_err(|e| CompressionError::Pdf(format!("failed to save: {}", e)))?;

    // Must run second: it bumps max_id and switches the xref type.
    let options = SaveOptions::builder()
        .use_object_streams(true)
        .use_xref_streams(true)
        .compression_level(9)
        .build();
    let mut packed = Vec::new();
    match doc.save_with_options(&mut packed, options) {
        Ok(()) if packed.len() < classic.len() => {
            debug!(classic = classic.len(), packed = packed.len(), "Using object streams");
            Ok(packed)
        }
        Ok(()) => Ok(classic),
        Err(err) => {
            debug!(error = %err, "Object stream save failed; keeping classic xref");
            Ok(classic)
        }
    }
}

/// Re-deflate plain Flate streams at the best level, keeping only the smaller result.
fn recompress_flate_streams(doc: &mut Document) -> usize {
    let graph: &Document = doc;
    let candidates: Vec<_> = graph
        .objects
        .iter()
        .filter_map(|(id, object)| match object {
            Object::Stream(stream)
                if FilterKind::of(graph, &stream.dict) == FilterKind::Flate
                    && stream.dict.resolved(graph, b"DecodeParms").is_none() =>
            {
                Some(*id)
            }
            _ => None,
        })
        .collect();

    let mut rewritten = 0;
    for id in candidates {
        let Ok(Object::Stream(stream)) = doc.get_object_mut(id) else {
            continue;
        };
        let Ok(plain) = inflate(&stream.content) else {
            continue;
        };
        let Ok(packed) = deflate_best(&plain) else {
            continue;
        };
        if packed.len() < stream.content.len() {
            stream.set_content(packed);
            rewritten += 1;
        }
    }
    rewritten
}

/// Cap on an unterminated trailer dictionary.
const TRAILER_WINDOW: usize = 4096;

/// An `/Encrypt` key in a trailer or cross-reference stream dictionary.
fn declares_encryption(bytes: &[u8]) -> bool {
    trailer_dictionaries(bytes).into_iter().any(has_encrypt_key)
}

fn trailer_dictionaries(bytes: &[u8]) -> Vec<&[u8]> {
    let mut dicts: Vec<&[u8]> = occurrences(bytes, b"trailer")
        .filter_map(|pos| dictionary_at(bytes, pos + b"trailer".len()))
        .collect();
    for pos in occurrences(bytes, b"/XRef") {
        let start = rfind(&bytes[..pos], b"obj").map_or(0, |p| p + 3);
        let end = find(&bytes[pos..], b"stream").map_or(bytes.len(), |p| pos + p);
        dicts.push(&bytes[start..end]);
    }
    dicts
}

/// The `<< ... >>` dictionary starting at `pos` after optional whitespace.
fn dictionary_at(bytes: &[u8], pos: usize) -> Option<&[u8]> {
    let skipped = bytes.get(pos..)?.iter().take_while(|b| b.is_ascii_whitespace()).count();
    let start = pos + skipped;
    let rest = &bytes[start..];
    if !rest.starts_with(b"<<") {
        return None;
    }
    let mut depth = 0usize;
    let mut i = 0;
    while i + 1 < rest.len() {
        match &rest[i..i + 2] {
            b"<<" => {
                depth += 1;
                i += 2;
            }
            b">>" => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return Some(&rest[..i]);
                }
            }
            _ => i += 1,
        }
    }
    Some(&rest[..rest.len().min(TRAILER_WINDOW)])
}

/// `/Encrypt` followed by a delimiter, so `/EncryptMetadata` does not count.
fn has_encrypt_key(dict: &[u8]) -> bool {
    const KEY: &[u8] = b"/Encrypt";
    dict.windows(KEY.len() + 1).any(|w| {
        w.starts_with(KEY)
            && matches!(
                w[KEY.len()],
                b' ' | b'\t' | b'\r' | b'\n' | b'\x0c' | b'\0' | b'<' | b'[' | b'(' | b'/'
            )
    })
}

fn occurrences<'a>(haystack: &'a [u8], needle: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
    haystack
        .windows(needle.len())
        .enumerate()
        .filter(move |(_, w)| *w == needle)
        .map(|(i, _)| i)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

fn classify_load_error(message: &str) -> CompressionError {
    let lower = message.to_lowercase();
    if ["password", "decrypt", "encrypt"].iter().any(|k| lower.contains(k)) {
        CompressionError::PasswordProtected(message.to_string())
    } else {
        CompressionError::CorruptedPdf(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::FailureCategory;
    use crate::pdf::graph::{image_ids, ImageObject};
    use crate::pdf::transform::decode_samples;
    use lopdf::{dictionary, Stream};
    use tempfile::TempDir;

    fn sample_pdf(path: &Path, samples: &[u8]) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 64,
                "Height" => 64,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            samples.to_vec(),
        ));
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            b"q 64 0 0 64 0 0 cm /Im0 Do Q".to_vec(),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![Object::Integer(0), Object::Integer(0), Object::Integer(64), Object::Integer(64)],
            "Resources" => dictionary! { "XObject" => dictionary! { "Im0" => image_id } },
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page_id)],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        // Nothing points at this one.
        doc.add_object(Stream::new(dictionary! {}, vec![b'z'; 4096]));
        doc.save(path).unwrap();
    }

    fn engine() -> RewriteEngine {
        RewriteEngine::new(85, RewriteConfig::default())
    }

    #[test]
    fn test_rewrite_shrinks_and_keeps_image_samples() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("in.pdf");
        let output = temp_dir.path().join("out.pdf");
        let samples: Vec<u8> = (0..64 * 64).map(|i| (i % 64) as u8).collect();
        sample_pdf(&input, &samples);

        engine().compress(&input, &output).unwrap();

        assert!(fs::metadata(&output).unwrap().len() < fs::metadata(&input).unwrap().len());
        let doc = Document::load(&output).unwrap();
        let ids = image_ids(&doc);
        assert_eq!(ids.len(), 1);
        let image = ImageObject::read(&doc, ids[0]).unwrap();
        assert_eq!(decode_samples(&image).unwrap(), samples);
        assert_eq!(doc.get_pages().len(), 1);
    }

    #[test]
    fn test_optimize_reports_pruned_objects() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("in.pdf");
        sample_pdf(&input, &vec![9; 64 * 64]);

        let mut doc = Document::load(&input).unwrap();
        let report = engine().optimize(&mut doc);
        assert!(report.pruned_objects >= 1);
        assert_eq!(report.images.rewritten_lossless, 1);
    }

    #[test]
    fn test_garbage_is_corrupted() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("broken.pdf");
        fs::write(&input, b"%PDF-1.4\nthis is not a pdf body at all").unwrap();

        let err = engine()
            .compress(&input, &temp_dir.path().join("out.pdf"))
            .unwrap_err();
        assert_eq!(err.category(), FailureCategory::CorruptedInput);
    }

    #[test]
    fn test_encrypted_trailer_is_password_protected() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("locked.pdf");
        fs::write(
            &input,
            b"%PDF-1.4\n1 0 obj\n<< /Type /Catalog >>\nendobj\ntrailer\n<< /Root 1 0 R /Encrypt 2 0 R >>\n%%EOF\n",
        )
        .unwrap();

        let err = engine()
            .compress(&input, &temp_dir.path().join("out.pdf"))
            .unwrap_err();
        assert_eq!(err.category(), FailureCategory::PasswordProtected);
    }

    #[test]
    fn test_declares_encryption() {
        assert!(declares_encryption(b"trailer\n<< /Encrypt 5 0 R >>\nstartxref\n9\n%%EOF"));
        assert!(declares_encryption(b"trailer<</Encrypt<</Filter/Standard>>>>"));
        assert!(declares_encryption(
            b"7 0 obj\n<< /Type /XRef /Size 8 /Encrypt 6 0 R >>\nstream\nxx\nendstream"
        ));
        assert!(!declares_encryption(b"trailer\n<< /EncryptMetadata false >>"));
        assert!(!declares_encryption(b"trailer\n<< /Root 1 0 R >>"));
        assert!(!declares_encryption(b"(the trailer) Tj /Encrypt 5 0 R"));
        // Outside any trailer the key means nothing.
        assert!(!declares_encryption(b"3 0 obj\n<< /Encrypt 5 0 R >>\nendobj"));
    }

    #[test]
    fn test_encrypt_text_in_content_stream_is_not_password_protected() {
        let mut doc = Document::with_version("1.5");
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            b"BT /F1 12 Tf (see /Encrypt 2 0 R in the trailer) Tj ET % /Encrypt <<".to_vec(),
        ));
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Note" => content_id });
        doc.trailer.set("Root", catalog_id);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        assert!(bytes.windows(9).any(|w| w == b"/Encrypt "));

        assert!(!declares_encryption(&bytes));
        let loaded = RewriteEngine::load(&bytes).unwrap();
        assert!(loaded.trailer.has(b"Root"));

        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("plain.pdf");
        fs::write(&input, &bytes).unwrap();
        engine().compress(&input, &temp_dir.path().join("out.pdf")).unwrap();
    }

    #[test]
    fn test_many_small_objects_are_packed_into_object_streams() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("outline.pdf");
        let output = temp_dir.path().join("out.pdf");

        let mut doc = Document::with_version("1.5");
        let entries: Vec<Object> = (0..300)
            .map(|i| {
                Object::Reference(doc.add_object(dictionary! {
                    "Type" => "Annot",
                    "Subtype" => "Text",
                    "Contents" => Object::string_literal(format!("note {}", i)),
                    "Open" => false,
                }))
            })
            .collect();
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Notes" => entries });
        doc.trailer.set("Root", catalog_id);
        doc.save(&input).unwrap();

        engine().compress(&input, &output).unwrap();

        let written = fs::read(&output).unwrap();
        assert!(written.len() < fs::metadata(&input).unwrap().len() as usize);
        assert!(written.windows(7).any(|w| w == b"/ObjStm"));
        let reloaded = Document::load_mem(&written).unwrap();
        let catalog = reloaded.catalog().unwrap();
        match catalog.get(b"Notes").unwrap() {
            Object::Array(items) => assert_eq!(items.len(), 300),
            other => panic!("unexpected Notes {:?}", other),
        }
    }

    #[test]
    fn test_tiny_document_keeps_classic_xref() {
        let mut doc = Document::with_version("1.5");
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog" });
        doc.trailer.set("Root", catalog_id);

        let bytes = serialize_smallest(&mut doc).unwrap();
        assert!(bytes.windows(7).any(|w| w == b"trailer"));
        assert!(!bytes.windows(7).any(|w| w == b"/ObjStm"));
    }

    #[test]
    fn test_classify_load_error() {
        assert!(matches!(
            classify_load_error("Decryption error: wrong password"),
            CompressionError::PasswordProtected(_)
        ));
        assert!(matches!(
            classify_load_error("Invalid file trailer"),
            CompressionError::CorruptedPdf(_)
        ));
    }
}
