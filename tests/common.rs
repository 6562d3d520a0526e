#![allow(dead_code)]

use lopdf::{dictionary, Document, Object, Stream};
use pdf_squeeze::batch::CancelToken;
use pdf_squeeze::config::BatchConfig;
use pdf_squeeze::engine::CompressionEngine;
use pdf_squeeze::error::{CompressionError, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use walkdir::WalkDir;

/// What the scripted engine does with one input file.
#[derive(Debug, Clone, Copy)]
pub enum Plan {
    Half,
    /// Write exactly this many bytes.
    Output(usize),
    Password,
    Corrupted,
    EngineFailure,
}

/// Engine keyed by file name, so batch tests control every outcome.
pub struct ScriptedEngine {
    plans: HashMap<String, Plan>,
    default: Plan,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    cancel_after: Option<(usize, CancelToken)>,
}

impl ScriptedEngine {
    /// Files without a plan come out at half their size.
    pub fn new() -> Self {
        Self {
            plans: HashMap::new(),
            default: Plan::Half,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            cancel_after: None,
        }
    }

    pub fn plan(mut self, file_name: &str, plan: Plan) -> Self {
        self.plans.insert(file_name.to_string(), plan);
        self
    }

    /// Trip `token` once `calls` files have been compressed.
    pub fn cancel_after(mut self, calls: usize, token: CancelToken) -> Self {
        self.cancel_after = Some((calls, token));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl CompressionEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn compress(&self, input: &Path, output: &Path) -> Result<()> {
        let name = input.file_name().unwrap().to_string_lossy().into_owned();
        self.seen.lock().unwrap().push(name.clone());
        let plan = self.plans.get(&name).copied().unwrap_or(self.default);

        let outcome = match plan {
            Plan::Half => {
                let len = fs::metadata(input)?.len() as usize;
                fs::write(output, vec![b'c'; (len / 2).max(1)]).map_err(CompressionError::from)
            }
            Plan::Output(len) => fs::write(output, vec![b'c'; len]).map_err(CompressionError::from),
            Plan::Password => Err(CompressionError::PasswordProtected("needs a password".into())),
            Plan::Corrupted => Err(CompressionError::CorruptedPdf("bad xref".into())),
            Plan::EngineFailure => Err(CompressionError::ExternalEngine("exit status 1".into())),
        };

        let done = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = &self.cancel_after {
            if done >= *limit {
                token.cancel();
            }
        }
        outcome
    }
}

/// Lets a test keep a handle on the engine it hands to the batch.
pub struct Shared(pub Arc<ScriptedEngine>);

impl CompressionEngine for Shared {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn compress(&self, input: &Path, output: &Path) -> Result<()> {
        self.0.compress(input, output)
    }
}

pub fn shared(engine: ScriptedEngine) -> (Arc<ScriptedEngine>, Box<dyn CompressionEngine>) {
    let engine = Arc::new(engine);
    (engine.clone(), Box::new(Shared(engine)))
}

/// Input tree, output tree and state files in separate temp directories.
pub struct Workspace {
    pub input: TempDir,
    pub output: TempDir,
    pub state: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            input: TempDir::new().unwrap(),
            output: TempDir::new().unwrap(),
            state: TempDir::new().unwrap(),
        }
    }

    pub fn config(&self) -> BatchConfig {
        BatchConfig {
            output_root: Some(self.output.path().to_path_buf()),
            checkpoint_path: self.checkpoint_path(),
            log_path: self.state.path().join("log.json"),
            flush_interval: 2,
            ..BatchConfig::new(self.input.path())
        }
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.state.path().join("checkpoint.json")
    }

    pub fn marker_path(&self) -> PathBuf {
        self.state.path().join("checkpoint.completed.json")
    }

    pub fn write(&self, relative: &str, len: usize) -> PathBuf {
        write_file(self.input.path(), relative, len)
    }
}

pub fn write_file(root: &Path, relative: &str, len: usize) -> PathBuf {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    fs::write(&path, data).unwrap();
    path
}

/// Relative path ("/"-joined) to file contents for every file under `root`.
pub fn tree_snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e
                .path()
                .strip_prefix(root)
                .unwrap()
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}

/// A one-page PDF with a raw 8-bit grayscale image and an unreferenced stream.
pub fn sample_pdf(path: &Path) {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let samples: Vec<u8> = (0..128 * 128).map(|i| ((i / 128) * 2) as u8).collect();
    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => 128,
            "Height" => 128,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
        },
        samples,
    ));
    let content_id = doc.add_object(Stream::new(
        dictionary! {},
        b"q 128 0 0 128 0 0 cm /Im0 Do Q".to_vec(),
    ));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "MediaBox" => vec![Object::Integer(0), Object::Integer(0), Object::Integer(128), Object::Integer(128)],
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
    doc.add_object(Stream::new(dictionary! {}, vec![b'z'; 8192]));
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    doc.save(path).unwrap();
}
