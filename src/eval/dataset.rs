//! Dataset loading for evaluation runs.
//!
//! Supports:
//! - ImageFolder exports (`data/metadata.jsonl` next to the images)
//! - In-memory datasets for tests and demos
//!
//! Sample order is the file order and must not change between invocations:
//! checkpoints resume by index.

use crate::error::{EvalError, Result};
use crate::eval::job::JobParameters;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the metadata file inside an ImageFolder export's `data/` directory.
pub const METADATA_FILE: &str = "metadata.jsonl";

fn default_language() -> String {
    "en".to_string()
}

/// A single labeled question about a document image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Annotation id.
    #[serde(alias = "annotation_id")]
    pub id: String,
    /// The question to answer.
    pub question: String,
    /// Ground-truth answers; several entries are list items that all belong
    /// in the answer.
    pub answers: Vec<String>,
    /// Normalized `[x0, y0, x1, y1]` box of the answer in the image.
    pub answer_bbox: Vec<f64>,
    /// ISO 639-1 language code.
    #[serde(default = "default_language")]
    pub language: String,
    /// Image file name, relative to the dataset's data directory.
    #[serde(alias = "file_name")]
    pub image_ref: String,
}

/// Ordered, randomly indexable collection of samples.
#[async_trait]
pub trait DatasetProvider: Send + Sync {
    /// Dataset name for logs.
    fn name(&self) -> &str;

    /// Number of samples.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The sample at `index`.
    async fn sample(&self, index: usize) -> Result<Sample>;

    /// Raw bytes of a sample's image.
    async fn image_bytes(&self, sample: &Sample) -> Result<Vec<u8>>;
}

/// Opens the dataset a job refers to.
#[async_trait]
pub trait DatasetLoader: Send + Sync {
    async fn open(&self, params: &JobParameters) -> Result<Box<dyn DatasetProvider>>;
}

/// A dataset exported in ImageFolder layout.
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    name: String,
    data_dir: PathBuf,
    samples: Vec<Sample>,
}

impl ImageFolderDataset {
    /// Load from an export directory containing `data/metadata.jsonl`.
    pub fn load(repo_dir: &Path) -> Result<Self> {
        let data_dir = repo_dir.join("data");
        let metadata_path = data_dir.join(METADATA_FILE);
        if !metadata_path.exists() {
            return Err(EvalError::Dataset(format!(
                "{} not found at {}",
                METADATA_FILE,
                metadata_path.display()
            )));
        }

        let content =
            fs::read_to_string(&metadata_path).map_err(|e| EvalError::io(&metadata_path, e))?;

        let mut samples = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let sample: Sample = serde_json::from_str(line).map_err(|e| {
                EvalError::Dataset(format!(
                    "Failed to parse sample at line {}: {}",
                    line_num + 1,
                    e
                ))
            })?;
            samples.push(sample);
        }

        let name = repo_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());

        Ok(Self {
            name,
            data_dir,
            samples,
        })
    }
}

#[async_trait]
impl DatasetProvider for ImageFolderDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    async fn sample(&self, index: usize) -> Result<Sample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or(EvalError::SampleNotFound {
                index,
                len: self.samples.len(),
            })
    }

    async fn image_bytes(&self, sample: &Sample) -> Result<Vec<u8>> {
        let path = self.data_dir.join(&sample.image_ref);
        tokio::fs::read(&path)
            .await
            .map_err(|source| EvalError::Image { path, source })
    }
}

/// Resolves job datasets below a local root directory.
///
/// A job for repo `acme/receipts-vqa` at version `v1.0.0` reads
/// `<root>/acme/receipts-vqa/v1.0.0`, falling back to
/// `<root>/acme/receipts-vqa` when no versioned copy exists.
#[derive(Debug, Clone)]
pub struct ImageFolderLoader {
    root: PathBuf,
}

impl ImageFolderLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, params: &JobParameters) -> PathBuf {
        let repo_dir = self.root.join(&params.hugging_face_repo_id);
        let versioned = repo_dir.join(&params.dataset_version);
        if versioned.join("data").join(METADATA_FILE).exists() {
            versioned
        } else {
            repo_dir
        }
    }
}

#[async_trait]
impl DatasetLoader for ImageFolderLoader {
    async fn open(&self, params: &JobParameters) -> Result<Box<dyn DatasetProvider>> {
        let dir = self.resolve(params);
        let dataset = tokio::task::spawn_blocking(move || ImageFolderDataset::load(&dir))
            .await
            .map_err(|e| EvalError::Dataset(format!("Dataset loader panicked: {}", e)))??;
        Ok(Box::new(dataset))
    }
}

/// A dataset held entirely in memory, images keyed by `image_ref`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    name: String,
    samples: Vec<Sample>,
    images: HashMap<String, Vec<u8>>,
}

impl InMemoryDataset {
    /// Create a new empty dataset.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Add a sample with its image bytes.
    pub fn add_sample(&mut self, sample: Sample, image: Vec<u8>) {
        self.images.insert(sample.image_ref.clone(), image);
        self.samples.push(sample);
    }

    /// Add a sample whose image is looked up by `image_ref` at read time.
    /// It may share an image with another sample, or have none.
    pub fn add_question(&mut self, sample: Sample) {
        self.samples.push(sample);
    }
}

#[async_trait]
impl DatasetProvider for InMemoryDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    async fn sample(&self, index: usize) -> Result<Sample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or(EvalError::SampleNotFound {
                index,
                len: self.samples.len(),
            })
    }

    async fn image_bytes(&self, sample: &Sample) -> Result<Vec<u8>> {
        self.images
            .get(&sample.image_ref)
            .cloned()
            .ok_or_else(|| EvalError::Image {
                path: PathBuf::from(&sample.image_ref),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "image not in dataset"),
            })
    }
}

/// Serves the same in-memory dataset to every job.
#[derive(Debug, Clone)]
pub struct StaticLoader {
    dataset: InMemoryDataset,
}

impl StaticLoader {
    pub fn new(dataset: InMemoryDataset) -> Self {
        Self { dataset }
    }
}

#[async_trait]
impl DatasetLoader for StaticLoader {
    async fn open(&self, _params: &JobParameters) -> Result<Box<dyn DatasetProvider>> {
        Ok(Box::new(self.dataset.clone()))
    }
}
