//! In-place recompression of image XObjects.
//!
//! Every image stream is decoded, re-encoded at maximum effort, and written
//! back only if the new bytes are strictly smaller than the old ones. A single
//! image failing never stops the pass.

use crate::pdf::encode::{decode_jpeg, encode_jpeg, encode_plane, inflate, undo_predictor, EncodedPlane};
use crate::pdf::graph::{image_ids, ColorSpace, FilterKind, ImageObject};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageOptions {
    pub quality: u8,
    pub zopfli: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformReport {
    pub images_seen: usize,
    pub rewritten_lossless: usize,
    pub rewritten_lossy: usize,
    /// Re-encoded fine but not smaller, so left alone.
    pub kept: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl TransformReport {
    pub fn rewritten(&self) -> usize {
        self.rewritten_lossless + self.rewritten_lossy
    }

    pub fn bytes_saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

enum Step {
    Lossless { before: usize, after: usize, consumed_mask: Option<ObjectId> },
    Lossy { before: usize, after: usize },
    Kept,
    Skipped(String),
    Failed(String),
}

/// Recompress every image stream in `doc`.
#[instrument(skip_all, fields(quality = options.quality))]
pub fn recompress_images(doc: &mut Document, options: &ImageOptions) -> TransformReport {
    let ids = image_ids(doc);

    // Soft masks are handled together with their owner when exactly one image uses them.
    let mut mask_users: HashMap<ObjectId, usize> = HashMap::new();
    for id in &ids {
        if let Ok(Object::Stream(stream)) = doc.get_object(*id) {
            if let Ok(Object::Reference(mask)) = stream.dict.get(b"SMask") {
                *mask_users.entry(*mask).or_default() += 1;
            }
        }
    }

    let mut report = TransformReport::default();
    let mut consumed: HashSet<ObjectId> = HashSet::new();

    let owners = ids.iter().filter(|id| !mask_users.contains_key(id));
    for id in owners {
        let step = process_image(doc, *id, options, &mask_users);
        if let Step::Lossless { consumed_mask: Some(mask), .. } = step {
            consumed.insert(mask);
        }
        tally(&mut report, *id, step);
    }

    let leftover_masks: Vec<ObjectId> = ids
        .iter()
        .filter(|id| mask_users.contains_key(id) && !consumed.contains(id))
        .copied()
        .collect();
    for id in leftover_masks {
        let step = process_image(doc, id, options, &HashMap::new());
        tally(&mut report, id, step);
    }

    debug!(
        seen = report.images_seen,
        lossless = report.rewritten_lossless,
        lossy = report.rewritten_lossy,
        kept = report.kept,
        skipped = report.skipped,
        failed = report.failed,
        saved = report.bytes_saved(),
        "Image pass finished"
    );
    report
}

fn tally(report: &mut TransformReport, id: ObjectId, step: Step) {
    report.images_seen += 1;
    match step {
        Step::Lossless { before, after, .. } => {
            report.rewritten_lossless += 1;
            report.bytes_before += before as u64;
            report.bytes_after += after as u64;
        }
        Step::Lossy { before, after } => {
            report.rewritten_lossy += 1;
            report.bytes_before += before as u64;
            report.bytes_after += after as u64;
        }
        Step::Kept => report.kept += 1,
        Step::Skipped(reason) => {
            debug!(object = ?id, %reason, "Image skipped");
            report.skipped += 1;
        }
        Step::Failed(reason) => {
            debug!(object = ?id, %reason, "Image left unmodified after error");
            report.failed += 1;
        }
    }
}

fn process_image(
    doc: &mut Document,
    id: ObjectId,
    options: &ImageOptions,
    mask_users: &HashMap<ObjectId, usize>,
) -> Step {
    let Some(image) = ImageObject::read(doc, id) else {
        return Step::Skipped("not a readable image".to_string());
    };
    match &image.filter {
        FilterKind::None | FilterKind::Flate => lossless(doc, &image, options, mask_users),
        FilterKind::Dct => lossy(doc, &image, options),
        FilterKind::Other(name) => Step::Skipped(format!("filter {} not handled", name)),
        FilterKind::Chain(n) => Step::Skipped(format!("{} chained filters", n)),
    }
}

/// Plain samples of a Flate or unfiltered image, exactly `expected_len` bytes.
pub fn decode_samples(image: &ImageObject) -> Result<Vec<u8>, String> {
    let raw = match image.filter {
        FilterKind::Flate => inflate(&image.data).map_err(|e| format!("inflate failed: {}", e))?,
        FilterKind::None => image.data.clone(),
        _ => return Err("not a lossless image".to_string()),
    };
    let mut samples = match &image.decode_parms {
        Some(parms) if parms.predictor > 1 => undo_predictor(raw, parms)?,
        _ => raw,
    };
    let expected = image
        .expected_len()
        .ok_or_else(|| "unknown sample layout".to_string())?;
    if samples.len() < expected {
        return Err(format!("expected {} sample bytes, found {}", expected, samples.len()));
    }
    samples.truncate(expected);
    Ok(samples)
}

/// The image's soft mask, if it is a private 8-bit gray plane of the same size.
fn alpha_plane(
    doc: &Document,
    image: &ImageObject,
    mask_users: &HashMap<ObjectId, usize>,
) -> Option<(ImageObject, Vec<u8>)> {
    let mask_id = image.smask?;
    if mask_users.get(&mask_id) != Some(&1) {
        return None;
    }
    let mask = ImageObject::read(doc, mask_id)?;
    let usable = matches!(mask.filter, FilterKind::None | FilterKind::Flate)
        && mask.width == image.width
        && mask.height == image.height
        && mask.bits_per_component == 8
        && mask.color_space == ColorSpace::DeviceGray;
    if !usable {
        return None;
    }
    let samples = decode_samples(&mask).ok()?;
    Some((mask, samples))
}

fn lossless(
    doc: &mut Document,
    image: &ImageObject,
    options: &ImageOptions,
    mask_users: &HashMap<ObjectId, usize>,
) -> Step {
    let Some(channels) = image.channels() else {
        return Step::Skipped(format!("color space {:?}", image.color_space));
    };
    if !matches!(image.bits_per_component, 1 | 2 | 4 | 8 | 16) {
        return Step::Skipped(format!("{} bits per component", image.bits_per_component));
    }
    let Ok(channels) = u8::try_from(channels) else {
        return Step::Skipped(format!("{} components", channels));
    };

    let samples = match decode_samples(image) {
        Ok(samples) => samples,
        Err(reason) => return Step::Failed(reason),
    };
    let alpha = alpha_plane(doc, image, mask_users);

    let color = match encode_plane(
        &samples,
        image.width,
        image.height,
        channels,
        image.bits_per_component,
        options.zopfli,
    ) {
        Ok(plane) => plane,
        Err(reason) => return Step::Failed(reason),
    };

    let mut before = image.data.len();
    let mut after = color.data.len();
    let mut encoded_alpha = None;
    if let Some((mask, alpha_samples)) = alpha {
        match encode_plane(&alpha_samples, mask.width, mask.height, 1, 8, options.zopfli) {
            Ok(plane) => {
                before += mask.data.len();
                after += plane.data.len();
                encoded_alpha = Some((mask, plane));
            }
            Err(reason) => return Step::Failed(reason),
        }
    }

    if after >= before {
        return Step::Kept;
    }

    // The mask is private to this image, so it is rewritten under its own id.
    let mut consumed_mask = None;
    if let Some((mask, plane)) = encoded_alpha {
        let Ok(Object::Stream(mask_stream)) = doc.get_object_mut(mask.id) else {
            return Step::Failed("soft mask vanished".to_string());
        };
        write_flate(mask_stream, plane, 8);
        consumed_mask = Some(mask.id);
    }

    let Ok(Object::Stream(stream)) = doc.get_object_mut(image.id) else {
        return Step::Failed("image object vanished".to_string());
    };
    write_flate(stream, color, image.bits_per_component);
    Step::Lossless {
        before,
        after,
        consumed_mask,
    }
}

fn write_flate(stream: &mut Stream, plane: EncodedPlane, bits_per_component: u8) {
    stream.dict.set("Filter", Object::Name(b"FlateDecode".to_vec()));
    match plane.png_rows {
        Some((colors, columns)) => stream.dict.set(
            "DecodeParms",
            dictionary! {
                "Predictor" => 15,
                "Colors" => colors as i64,
                "BitsPerComponent" => bits_per_component as i64,
                "Columns" => columns as i64,
            },
        ),
        None => {
            stream.dict.remove(b"DecodeParms");
        }
    }
    stream.set_content(plane.data);
}

fn lossy(doc: &mut Document, image: &ImageObject, options: &ImageOptions) -> Step {
    let decoded = match decode_jpeg(&image.data) {
        Ok(decoded) => decoded,
        Err(reason) => return Step::Failed(reason),
    };
    if (decoded.width, decoded.height) != (image.width, image.height) {
        return Step::Skipped("JPEG dimensions differ from the image dictionary".to_string());
    }
    if image.channels() != Some(decoded.channels as usize) {
        return Step::Skipped(format!(
            "{:?} does not match {} decoded channels",
            image.color_space, decoded.channels
        ));
    }

    let jpeg = match encode_jpeg(
        &decoded.pixels,
        decoded.width,
        decoded.height,
        decoded.channels,
        options.quality,
    ) {
        Ok(jpeg) => jpeg,
        Err(reason) => return Step::Failed(reason),
    };
    let (before, after) = (image.data.len(), jpeg.len());
    if after >= before {
        return Step::Kept;
    }

    let Ok(Object::Stream(stream)) = doc.get_object_mut(image.id) else {
        return Step::Failed("image object vanished".to_string());
    };
    stream.dict.set("Filter", Object::Name(b"DCTDecode".to_vec()));
    stream.dict.set("BitsPerComponent", 8);
    stream.dict.remove(b"DecodeParms");
    stream.set_content(jpeg);
    Step::Lossy { before, after }
}
