//! Typed views over `lopdf` objects.
//!
//! `lopdf::Object` is an untyped tagged union; everything the image transform
//! needs to know about a stream is pulled out here once, with indirect
//! references followed.

use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

const MAX_REFERENCE_HOPS: usize = 8;

/// Follow indirect references until a direct object is reached.
pub fn resolve<'a>(doc: &'a Document, mut object: &'a Object) -> Option<&'a Object> {
    for _ in 0..MAX_REFERENCE_HOPS {
        match object {
            Object::Reference(id) => object = doc.get_object(*id).ok()?,
            direct => return Some(direct),
        }
    }
    None
}

pub trait DictExt {
    fn resolved<'a>(&'a self, doc: &'a Document, key: &[u8]) -> Option<&'a Object>;

    fn int_value(&self, doc: &Document, key: &[u8]) -> Option<i64> {
        match self.resolved(doc, key)? {
            Object::Integer(value) => Some(*value),
            Object::Real(value) if value.fract() == 0.0 => Some(*value as i64),
            _ => None,
        }
    }

    fn name_value<'a>(&'a self, doc: &'a Document, key: &[u8]) -> Option<&'a [u8]> {
        match self.resolved(doc, key)? {
            Object::Name(name) => Some(name.as_slice()),
            _ => None,
        }
    }

    fn bool_value(&self, doc: &Document, key: &[u8]) -> Option<bool> {
        match self.resolved(doc, key)? {
            Object::Boolean(value) => Some(*value),
            _ => None,
        }
    }
}

impl DictExt for Dictionary {
    fn resolved<'a>(&'a self, doc: &'a Document, key: &[u8]) -> Option<&'a Object> {
        resolve(doc, self.get(key).ok()?)
    }
}

/// Declared `/Filter` of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterKind {
    None,
    Flate,
    Dct,
    /// A single filter this crate does not re-encode (JPX, CCITT, LZW, ...).
    Other(String),
    /// More than one filter in the chain.
    Chain(usize),
}

impl FilterKind {
    pub fn of(doc: &Document, dict: &Dictionary) -> FilterKind {
        let Some(filter) = dict.resolved(doc, b"Filter") else {
            return FilterKind::None;
        };
        match filter {
            Object::Name(name) => FilterKind::from_name(name),
            Object::Array(items) => match items.as_slice() {
                [] => FilterKind::None,
                [single] => match resolve(doc, single) {
                    Some(Object::Name(name)) => FilterKind::from_name(name),
                    _ => FilterKind::Other("?".to_string()),
                },
                chain => FilterKind::Chain(chain.len()),
            },
            Object::Null => FilterKind::None,
            _ => FilterKind::Other("?".to_string()),
        }
    }

    fn from_name(name: &[u8]) -> FilterKind {
        match name {
            b"FlateDecode" | b"Fl" => FilterKind::Flate,
            b"DCTDecode" | b"DCT" => FilterKind::Dct,
            other => FilterKind::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }
}

/// Image color space, reduced to what matters for sample layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorSpace {
    DeviceGray,
    DeviceRgb,
    DeviceCmyk,
    CalGray,
    CalRgb,
    Lab,
    IccBased(u8),
    Indexed,
    Separation,
    DeviceN(u8),
    /// Stencil masks carry no color space.
    StencilMask,
    Unknown(String),
}

impl ColorSpace {
    pub fn parse(doc: &Document, object: &Object) -> ColorSpace {
        let Some(object) = resolve(doc, object) else {
            return ColorSpace::Unknown("dangling".to_string());
        };
        match object {
            Object::Name(name) => ColorSpace::from_family(name),
            Object::Array(items) => {
                let family = match items.first().and_then(|o| resolve(doc, o)) {
                    Some(Object::Name(name)) => name.as_slice(),
                    _ => return ColorSpace::Unknown("array".to_string()),
                };
                match family {
                    b"ICCBased" => items
                        .get(1)
                        .and_then(|o| resolve(doc, o))
                        .and_then(|o| match o {
                            Object::Stream(stream) => stream.dict.int_value(doc, b"N"),
                            _ => None,
                        })
                        .and_then(|n| u8::try_from(n).ok())
                        .map(ColorSpace::IccBased)
                        .unwrap_or_else(|| ColorSpace::Unknown("ICCBased".to_string())),
                    b"Indexed" | b"I" => ColorSpace::Indexed,
                    b"Separation" => ColorSpace::Separation,
                    b"DeviceN" => match items.get(1).and_then(|o| resolve(doc, o)) {
                        Some(Object::Array(names)) => u8::try_from(names.len())
                            .map(ColorSpace::DeviceN)
                            .unwrap_or_else(|_| ColorSpace::Unknown("DeviceN".to_string())),
                        _ => ColorSpace::Unknown("DeviceN".to_string()),
                    },
                    other => ColorSpace::from_family(other),
                }
            }
            _ => ColorSpace::Unknown("?".to_string()),
        }
    }

    fn from_family(name: &[u8]) -> ColorSpace {
        match name {
            b"DeviceGray" | b"G" => ColorSpace::DeviceGray,
            b"DeviceRGB" | b"RGB" => ColorSpace::DeviceRgb,
            b"DeviceCMYK" | b"CMYK" => ColorSpace::DeviceCmyk,
            b"CalGray" => ColorSpace::CalGray,
            b"CalRGB" => ColorSpace::CalRgb,
            b"Lab" => ColorSpace::Lab,
            b"Indexed" | b"I" => ColorSpace::Indexed,
            b"Separation" => ColorSpace::Separation,
            other => ColorSpace::Unknown(String::from_utf8_lossy(other).into_owned()),
        }
    }

    /// Color components per sample.
    pub fn channels(&self) -> Option<u8> {
        match self {
            ColorSpace::DeviceGray
            | ColorSpace::CalGray
            | ColorSpace::Indexed
            | ColorSpace::Separation
            | ColorSpace::StencilMask => Some(1),
            ColorSpace::DeviceRgb | ColorSpace::CalRgb | ColorSpace::Lab => Some(3),
            ColorSpace::DeviceCmyk => Some(4),
            ColorSpace::IccBased(n) | ColorSpace::DeviceN(n) => Some(*n),
            ColorSpace::Unknown(_) => None,
        }
    }
}

/// Parameters of a `/DecodeParms` dictionary that affect sample layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeParms {
    pub predictor: i64,
    pub colors: i64,
    pub bits_per_component: i64,
    pub columns: i64,
}

impl DecodeParms {
    pub fn read(doc: &Document, dict: &Dictionary) -> Option<DecodeParms> {
        let parms = match dict.resolved(doc, b"DecodeParms")? {
            Object::Dictionary(parms) => parms,
            Object::Array(items) if items.len() == 1 => match resolve(doc, &items[0])? {
                Object::Dictionary(parms) => parms,
                _ => return None,
            },
            _ => return None,
        };
        Some(DecodeParms {
            predictor: parms.int_value(doc, b"Predictor").unwrap_or(1),
            colors: parms.int_value(doc, b"Colors").unwrap_or(1),
            bits_per_component: parms.int_value(doc, b"BitsPerComponent").unwrap_or(8),
            columns: parms.int_value(doc, b"Columns").unwrap_or(1),
        })
    }
}

/// An image XObject pulled out of the object graph.
#[derive(Debug, Clone)]
pub struct ImageObject {
    pub id: ObjectId,
    pub filter: FilterKind,
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub color_space: ColorSpace,
    pub bits_per_component: u8,
    pub decode_parms: Option<DecodeParms>,
    pub smask: Option<ObjectId>,
}

impl ImageObject {
    /// `None` when `id` is not an image stream or lacks usable dimensions.
    pub fn read(doc: &Document, id: ObjectId) -> Option<ImageObject> {
        let stream = match doc.get_object(id).ok()? {
            Object::Stream(stream) => stream,
            _ => return None,
        };
        if !is_image(doc, stream) {
            return None;
        }
        let dict = &stream.dict;

        let width = u32::try_from(dict.int_value(doc, b"Width")?).ok()?;
        let height = u32::try_from(dict.int_value(doc, b"Height")?).ok()?;
        if width == 0 || height == 0 {
            return None;
        }

        let is_mask = dict.bool_value(doc, b"ImageMask").unwrap_or(false);
        let color_space = if is_mask {
            ColorSpace::StencilMask
        } else {
            dict.get(b"ColorSpace")
                .map(|cs| ColorSpace::parse(doc, cs))
                .unwrap_or_else(|_| ColorSpace::Unknown("missing".to_string()))
        };
        let bits_per_component = if is_mask {
            1
        } else {
            dict.int_value(doc, b"BitsPerComponent")
                .and_then(|b| u8::try_from(b).ok())
                .unwrap_or(8)
        };
        let smask = match dict.get(b"SMask") {
            Ok(Object::Reference(id)) => Some(*id),
            _ => None,
        };

        Some(ImageObject {
            id,
            filter: FilterKind::of(doc, dict),
            data: stream.content.clone(),
            width,
            height,
            color_space,
            bits_per_component,
            decode_parms: DecodeParms::read(doc, dict),
            smask,
        })
    }

    pub fn channels(&self) -> Option<usize> {
        self.color_space.channels().map(usize::from)
    }

    /// Bytes per decoded row, rounded up to whole bytes.
    pub fn row_bytes(&self) -> Option<usize> {
        let bits = (self.width as usize)
            .checked_mul(self.channels()?)?
            .checked_mul(self.bits_per_component as usize)?;
        Some(bits.div_ceil(8))
    }

    pub fn expected_len(&self) -> Option<usize> {
        self.row_bytes()?.checked_mul(self.height as usize)
    }
}

pub fn is_image(doc: &Document, stream: &Stream) -> bool {
    stream.dict.name_value(doc, b"Subtype") == Some(b"Image".as_slice())
}

/// Ids of every image stream, in object order.
pub fn image_ids(doc: &Document) -> Vec<ObjectId> {
    doc.objects
        .iter()
        .filter_map(|(id, object)| match object {
            Object::Stream(stream) if is_image(doc, stream) => Some(*id),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;

    fn image_stream(extra: Dictionary) -> Stream {
        let mut dict = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => 4,
            "Height" => 2,
            "BitsPerComponent" => 8,
        };
        for (key, value) in extra.iter() {
            dict.set(key.clone(), value.clone());
        }
        Stream::new(dict, vec![0; 24])
    }

    #[test]
    fn test_filter_kind() {
        let doc = Document::with_version("1.5");
        let dict = dictionary! { "Filter" => "FlateDecode" };
        assert_eq!(FilterKind::of(&doc, &dict), FilterKind::Flate);

        let dict = dictionary! { "Filter" => vec![Object::Name(b"DCTDecode".to_vec())] };
        assert_eq!(FilterKind::of(&doc, &dict), FilterKind::Dct);

        let dict = dictionary! {
            "Filter" => vec![Object::Name(b"ASCII85Decode".to_vec()), Object::Name(b"FlateDecode".to_vec())]
        };
        assert_eq!(FilterKind::of(&doc, &dict), FilterKind::Chain(2));

        assert_eq!(FilterKind::of(&doc, &Dictionary::new()), FilterKind::None);
        let dict = dictionary! { "Filter" => "JPXDecode" };
        assert_eq!(FilterKind::of(&doc, &dict), FilterKind::Other("JPXDecode".to_string()));
    }

    #[test]
    fn test_color_space_channels() {
        let mut doc = Document::with_version("1.5");
        let icc = doc.add_object(Stream::new(dictionary! { "N" => 3 }, vec![]));

        let cases = vec![
            (Object::Name(b"DeviceGray".to_vec()), Some(1)),
            (Object::Name(b"DeviceRGB".to_vec()), Some(3)),
            (Object::Name(b"DeviceCMYK".to_vec()), Some(4)),
            (
                Object::Array(vec![Object::Name(b"ICCBased".to_vec()), Object::Reference(icc)]),
                Some(3),
            ),
            (
                Object::Array(vec![
                    Object::Name(b"Indexed".to_vec()),
                    Object::Name(b"DeviceRGB".to_vec()),
                    Object::Integer(255),
                    Object::String(vec![], lopdf::StringFormat::Hexadecimal),
                ]),
                Some(1),
            ),
            (
                Object::Array(vec![
                    Object::Name(b"DeviceN".to_vec()),
                    Object::Array(vec![Object::Name(b"Cyan".to_vec()), Object::Name(b"Spot".to_vec())]),
                ]),
                Some(2),
            ),
            (Object::Name(b"Pattern".to_vec()), None),
        ];
        for (object, channels) in cases {
            assert_eq!(ColorSpace::parse(&doc, &object).channels(), channels, "{:?}", object);
        }
    }

    #[test]
    fn test_image_object_read_resolves_references() {
        let mut doc = Document::with_version("1.5");
        let width = doc.add_object(Object::Integer(4));
        let id = doc.add_object(image_stream(dictionary! {
            "Width" => Object::Reference(width),
            "ColorSpace" => "DeviceRGB",
            "Filter" => "FlateDecode",
            "DecodeParms" => dictionary! { "Predictor" => 15, "Colors" => 3, "Columns" => 4 },
        }));

        let image = ImageObject::read(&doc, id).unwrap();
        assert_eq!((image.width, image.height), (4, 2));
        assert_eq!(image.channels(), Some(3));
        assert_eq!(image.filter, FilterKind::Flate);
        assert_eq!(image.decode_parms.unwrap().predictor, 15);
        assert_eq!(image.row_bytes(), Some(12));
        assert_eq!(image.expected_len(), Some(24));
        assert_eq!(image_ids(&doc), vec![id]);
    }

    #[test]
    fn test_stencil_mask_is_one_bit() {
        let mut doc = Document::with_version("1.5");
        let id = doc.add_object(image_stream(dictionary! { "ImageMask" => true }));
        let image = ImageObject::read(&doc, id).unwrap();
        assert_eq!(image.color_space, ColorSpace::StencilMask);
        assert_eq!(image.bits_per_component, 1);
        assert_eq!(image.row_bytes(), Some(1));
    }

    #[test]
    fn test_non_image_stream_is_ignored() {
        let mut doc = Document::with_version("1.5");
        let id = doc.add_object(Stream::new(dictionary! {}, b"BT ET".to_vec()));
        assert!(ImageObject::read(&doc, id).is_none());
        assert!(image_ids(&doc).is_empty());
    }
}
