//! CIFAR-10 fetch, decode and `.npy` packaging.
//!
//! The binary release is a tarball of `data_batch_{1..5}.bin` (train) and
//! `test_batch.bin` (test). Each record is one label byte followed by 3072
//! bytes of planar RGB (1024 R, 1024 G, 1024 B, row-major 32x32).
//!
//! Packaged layout under `data_dir`:
//!
//! ```text
//! train/x_train.npy  u8 (N, 32, 32, 3)
//! train/y_train.npy  u8 (N, 1)
//! test/x_test.npy    u8 (N, 32, 32, 3)
//! test/y_test.npy    u8 (N, 1)
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use ndarray::{concatenate, Array1, Array2, Array4, Axis};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::command::extract_tar_gz;
use crate::config::DatasetConfig;
use crate::error::{PipelineError, Result};
use crate::inference::{ChannelOrder, RawImage};

pub const CIFAR10_BINARY_URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz";
pub const ARCHIVE_NAME: &str = "cifar-10-binary.tar.gz";
pub const BATCHES_DIR: &str = "cifar-10-batches-bin";
pub const TRAIN_BATCHES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
pub const TEST_BATCH: &str = "test_batch.bin";

pub const IMAGE_SIDE: usize = 32;
pub const CHANNELS: usize = 3;
pub const PLANE_BYTES: usize = IMAGE_SIDE * IMAGE_SIDE;
pub const IMAGE_BYTES: usize = PLANE_BYTES * CHANNELS;
pub const RECORD_BYTES: usize = IMAGE_BYTES + 1;
pub const TRAIN_COUNT: usize = 50_000;
pub const TEST_COUNT: usize = 10_000;
pub const NUM_CLASSES: usize = 10;

pub const CLASS_NAMES: [&str; NUM_CLASSES] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

pub fn class_name(label: usize) -> Option<&'static str> {
    CLASS_NAMES.get(label).copied()
}

/// Which half of the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }

    fn file_names(&self) -> (String, String) {
        let name = self.name();
        (format!("x_{}.npy", name), format!("y_{}.npy", name))
    }
}

/// Ordered (image, label) pairs; images are channels-last `u8`.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub images: Array4<u8>,
    pub labels: Array1<u8>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Decode a concatenation of binary records.
    pub fn from_records(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % RECORD_BYTES != 0 {
            return Err(PipelineError::Dataset(format!(
                "batch length {} is not a multiple of the {}-byte record size",
                bytes.len(),
                RECORD_BYTES
            )));
        }
        let count = bytes.len() / RECORD_BYTES;
        let mut pixels = Vec::with_capacity(count * IMAGE_BYTES);
        let mut labels = Vec::with_capacity(count);
        for (idx, record) in bytes.chunks_exact(RECORD_BYTES).enumerate() {
            let label = record[0];
            if label as usize >= NUM_CLASSES {
                return Err(PipelineError::Dataset(format!(
                    "record {} has label {} outside 0..{}",
                    idx, label, NUM_CLASSES
                )));
            }
            labels.push(label);
            let image = RawImage::new(record[1..].to_vec(), ChannelOrder::PlanarRgb)?;
            pixels.extend(image.to_hwc_rgb());
        }
        Ok(Self {
            images: Array4::from_shape_vec((count, IMAGE_SIDE, IMAGE_SIDE, CHANNELS), pixels)?,
            labels: Array1::from(labels),
        })
    }

    /// Stack partitions in order.
    pub fn concat(parts: &[Partition]) -> Result<Self> {
        if parts.is_empty() {
            return Err(PipelineError::Dataset("no batches to concatenate".to_string()));
        }
        let images: Vec<_> = parts.iter().map(|p| p.images.view()).collect();
        let labels: Vec<_> = parts.iter().map(|p| p.labels.view()).collect();
        Ok(Self {
            images: concatenate(Axis(0), &images)?,
            labels: concatenate(Axis(0), &labels)?,
        })
    }

    /// Write `x_<split>.npy` and `y_<split>.npy` into `dir`.
    pub fn write_npy(&self, dir: &Path, split: Split) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let (x_name, y_name) = split.file_names();
        self.images
            .write_npy(BufWriter::new(File::create(dir.join(x_name))?))?;
        let labels: Array2<u8> = self.labels.clone().insert_axis(Axis(1));
        labels.write_npy(BufWriter::new(File::create(dir.join(y_name))?))?;
        Ok(())
    }

    /// Read back what [`Partition::write_npy`] wrote.
    pub fn read_npy(dir: &Path, split: Split) -> Result<Self> {
        let (x_name, y_name) = split.file_names();
        let images = Array4::<u8>::read_npy(BufReader::new(File::open(dir.join(x_name))?))?;
        let labels = Array2::<u8>::read_npy(BufReader::new(File::open(dir.join(y_name))?))?;
        if labels.ncols() != 1 || labels.nrows() != images.shape()[0] {
            return Err(PipelineError::Dataset(format!(
                "label array shape {:?} does not match {} images",
                labels.shape(),
                images.shape()[0]
            )));
        }
        Ok(Self {
            images,
            labels: labels.column(0).to_owned(),
        })
    }
}

/// Train and test partitions.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub train: Partition,
    pub test: Partition,
}

/// Result of a fetch: decoded partitions plus where the raw batches live.
#[derive(Debug, Clone)]
pub struct FetchedDataset {
    pub dataset: Dataset,
    pub batches_dir: PathBuf,
}

/// Local paths of the packaged partitions.
#[derive(Debug, Clone)]
pub struct PackagedDataset {
    pub train_dir: PathBuf,
    pub test_dir: PathBuf,
}

/// Serialize both partitions under `data_dir/{train,test}`.
pub fn package(dataset: &Dataset, data_dir: &Path) -> Result<PackagedDataset> {
    let train_dir = data_dir.join(Split::Train.name());
    let test_dir = data_dir.join(Split::Test.name());
    dataset.train.write_npy(&train_dir, Split::Train)?;
    dataset.test.write_npy(&test_dir, Split::Test)?;
    info!(
        train = dataset.train.len(),
        test = dataset.test.len(),
        dir = %data_dir.display(),
        "dataset packaged"
    );
    Ok(PackagedDataset {
        train_dir,
        test_dir,
    })
}

/// Downloads, extracts and decodes the dataset.
#[derive(Debug, Clone)]
pub struct DatasetFetcher {
    url: String,
    work_dir: PathBuf,
    expected_train: usize,
    expected_test: usize,
}

impl DatasetFetcher {
    pub fn new(url: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            work_dir: work_dir.into(),
            expected_train: TRAIN_COUNT,
            expected_test: TEST_COUNT,
        }
    }

    pub fn from_config(config: &DatasetConfig) -> Self {
        Self::new(config.url.clone(), config.work_dir.clone())
            .with_expected_counts(config.expected_train, config.expected_test)
    }

    pub fn with_expected_counts(mut self, train: usize, test: usize) -> Self {
        self.expected_train = train;
        self.expected_test = test;
        self
    }

    pub fn archive_path(&self) -> PathBuf {
        self.work_dir.join(ARCHIVE_NAME)
    }

    pub fn batches_dir(&self) -> PathBuf {
        self.work_dir.join(BATCHES_DIR)
    }

    /// Download the tarball unless it is already cached in the work directory.
    pub async fn download(&self) -> Result<PathBuf> {
        let archive = self.archive_path();
        if archive.exists() {
            debug!(path = %archive.display(), "dataset archive cached");
            return Ok(archive);
        }
        std::fs::create_dir_all(&self.work_dir)?;
        let partial = archive.with_extension("part");

        if let Some(local) = self.url.strip_prefix("file://") {
            info!(source = local, "copying dataset archive");
            tokio::fs::copy(local, &partial).await?;
        } else {
            info!(url = %self.url, "downloading dataset archive");
            let mut response = reqwest::get(&self.url).await?.error_for_status()?;
            let mut file = tokio::fs::File::create(&partial).await?;
            let mut total = 0usize;
            while let Some(chunk) = response.chunk().await? {
                total += chunk.len();
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            debug!(bytes = total, "download complete");
        }
        tokio::fs::rename(&partial, &archive).await?;
        Ok(archive)
    }

    /// Decode the extracted batch files and check partition sizes.
    pub fn load_batches(&self, batches_dir: &Path) -> Result<Dataset> {
        let train_parts = TRAIN_BATCHES
            .iter()
            .map(|name| read_batch(&batches_dir.join(name)))
            .collect::<Result<Vec<_>>>()?;
        let train = Partition::concat(&train_parts)?;
        let test = read_batch(&batches_dir.join(TEST_BATCH))?;

        for (split, got, want) in [
            (Split::Train, train.len(), self.expected_train),
            (Split::Test, test.len(), self.expected_test),
        ] {
            if got != want {
                return Err(PipelineError::Dataset(format!(
                    "{} partition has {} images, expected {}",
                    split.name(),
                    got,
                    want
                )));
            }
        }
        Ok(Dataset { train, test })
    }

    pub async fn fetch(&self) -> Result<FetchedDataset> {
        let archive = self.download().await?;
        extract_tar_gz(&archive, &self.work_dir).await?;
        let batches_dir = self.batches_dir();
        let dataset = self.load_batches(&batches_dir)?;
        info!(
            train = dataset.train.len(),
            test = dataset.test.len(),
            "dataset decoded"
        );
        Ok(FetchedDataset {
            dataset,
            batches_dir,
        })
    }
}

fn read_batch(path: &Path) -> Result<Partition> {
    let bytes = std::fs::read(path)?;
    Partition::from_records(&bytes)
}

/// The first `count` test records as undecoded images, with their labels.
pub fn sample_images(batches_dir: &Path, count: usize) -> Result<Vec<(RawImage, u8)>> {
    let bytes = std::fs::read(batches_dir.join(TEST_BATCH))?;
    let available = bytes.len() / RECORD_BYTES;
    if available < count {
        return Err(PipelineError::Dataset(format!(
            "requested {} samples, test batch holds {}",
            count, available
        )));
    }
    bytes
        .chunks_exact(RECORD_BYTES)
        .take(count)
        .map(|record| {
            let image = RawImage::new(record[1..].to_vec(), ChannelOrder::PlanarRgb)?;
            Ok((image, record[0]))
        })
        .collect()
}
