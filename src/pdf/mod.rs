pub mod encode;
pub mod graph;
pub mod transform;

pub use graph::{ColorSpace, DictExt, FilterKind, ImageObject};
pub use transform::{recompress_images, ImageOptions, TransformReport};
