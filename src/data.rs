//! # Image Datasets and Loading
//!
//! Real data only enters a teaching run through this module:
//! - MNIST-style IDX archives (raw or gzip-compressed)
//! - A deterministic synthetic "class block" set for demos and tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use generative_teaching::data::{load_mnist_dir, DataLoader, DatasetSplits};
//!
//! let (train, test) = load_mnist_dir("data/mnist", &device)?;
//! let splits = DatasetSplits::from_train_test(train, test, 0.1)?.normalized(0.1307, 0.3081)?;
//! let mut loader = DataLoader::new(splits.train.clone(), 128, true, 0);
//! let (images, labels) = loader.next_cycling()?;
//! ```

use candle_core::{DType, Device, IndexOp, Tensor};
use flate2::read::GzDecoder;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::GtnError;
use crate::GtnResult;

const IDX_IMAGES_MAGIC: u32 = 0x0000_0803;
const IDX_LABELS_MAGIC: u32 = 0x0000_0801;

/// Labelled single-channel images
#[derive(Debug, Clone)]
pub struct ImageDataset {
    /// `(N, 1, H, W)` f32
    images: Tensor,
    /// `(N)` u32
    labels: Tensor,
    num_classes: usize,
}

impl ImageDataset {
    pub fn new(images: Tensor, labels: Tensor, num_classes: usize) -> GtnResult<Self> {
        let (n, c, _, _) = images.dims4()?;
        if c != 1 {
            return Err(GtnError::DimensionMismatch { expected: 1, got: c });
        }
        if labels.dims1()? != n {
            return Err(GtnError::DimensionMismatch {
                expected: n,
                got: labels.dims1()?,
            });
        }
        Ok(Self {
            images: images.to_dtype(DType::F32)?,
            labels: labels.to_dtype(DType::U32)?,
            num_classes,
        })
    }

    /// Deterministic dataset where class `c` lights up the `c`-th 2x2 block
    /// of the image, plus Gaussian pixel noise. Pixel values are in `[0, 1]`
    /// before noise.
    pub fn synthetic_blocks(
        n: usize,
        image_size: usize,
        num_classes: usize,
        noise_std: f64,
        seed: u64,
        device: &Device,
    ) -> GtnResult<Self> {
        let blocks_per_row = image_size / 2;
        if blocks_per_row == 0 || num_classes > blocks_per_row * blocks_per_row {
            return Err(GtnError::InvalidConfig(format!(
                "{} classes do not fit a {}x{} block grid",
                num_classes, image_size, image_size
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0f32, noise_std as f32)
            .map_err(|e| GtnError::InvalidConfig(format!("noise distribution: {}", e)))?;

        let pixels = image_size * image_size;
        let mut images = Vec::with_capacity(n * pixels);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let class = i % num_classes;
            let (by, bx) = (class / blocks_per_row, class % blocks_per_row);
            for y in 0..image_size {
                for x in 0..image_size {
                    let lit = y / 2 == by && x / 2 == bx;
                    let base = if lit { 1.0 } else { 0.0 };
                    images.push(base + noise.sample(&mut rng));
                }
            }
            labels.push(class as u32);
        }
        let images = Tensor::from_vec(images, (n, 1, image_size, image_size), device)?;
        let labels = Tensor::from_vec(labels, n, device)?;
        Self::new(images, labels, num_classes)
    }

    pub fn images(&self) -> &Tensor {
        &self.images
    }

    pub fn labels(&self) -> &Tensor {
        &self.labels
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Side length of the (square) images
    pub fn image_size(&self) -> usize {
        self.images.dims()[2]
    }

    /// Rows `[start, end)`
    pub fn slice(&self, start: usize, end: usize) -> GtnResult<Self> {
        let end = end.min(self.len());
        Ok(Self {
            images: self.images.i(start..end)?,
            labels: self.labels.i(start..end)?,
            num_classes: self.num_classes,
        })
    }

    /// Rows at `indices`
    pub fn select(&self, indices: &[u32]) -> GtnResult<(Tensor, Tensor)> {
        let idx = Tensor::from_slice(indices, indices.len(), self.images.device())?;
        Ok((
            self.images.index_select(&idx, 0)?,
            self.labels.index_select(&idx, 0)?,
        ))
    }

    /// Pixel mean and standard deviation
    pub fn statistics(&self) -> GtnResult<(f64, f64)> {
        let mean: f32 = self.images.mean_all()?.to_scalar()?;
        let var: f32 = self.images.affine(1.0, -(mean as f64))?.sqr()?.mean_all()?.to_scalar()?;
        Ok((mean as f64, (var as f64).sqrt()))
    }

    /// Copy with pixels mapped to `(x - mean) / std`
    pub fn normalized(&self, mean: f64, std: f64) -> GtnResult<Self> {
        if std <= 0.0 {
            return Err(GtnError::InvalidConfig(format!("std must be positive, got {}", std)));
        }
        Ok(Self {
            images: self.images.affine(1.0 / std, -mean / std)?,
            labels: self.labels.clone(),
            num_classes: self.num_classes,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SPLITS
// ═══════════════════════════════════════════════════════════════════════════

/// Train / validation / test partitions
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: ImageDataset,
    pub validation: ImageDataset,
    pub test: ImageDataset,
}

impl DatasetSplits {
    /// Hold out the last `validation_fraction` of `train` for validation
    pub fn from_train_test(
        train: ImageDataset,
        test: ImageDataset,
        validation_fraction: f64,
    ) -> GtnResult<Self> {
        if !(0.0..1.0).contains(&validation_fraction) {
            return Err(GtnError::InvalidConfig(format!(
                "validation fraction must be in [0, 1), got {}",
                validation_fraction
            )));
        }
        let n = train.len();
        let n_val = ((n as f64) * validation_fraction).round() as usize;
        if n_val == 0 || n_val >= n {
            return Err(GtnError::DataExhausted(format!(
                "cannot hold out {} of {} training rows for validation",
                n_val, n
            )));
        }
        let validation = train.slice(n - n_val, n)?;
        let train = train.slice(0, n - n_val)?;
        log::info!(
            "Dataset splits: train={}, validation={}, test={}",
            train.len(),
            validation.len(),
            test.len()
        );
        Ok(Self {
            train,
            validation,
            test,
        })
    }

    /// Normalise all splits with the same statistics
    pub fn normalized(&self, mean: f64, std: f64) -> GtnResult<Self> {
        Ok(Self {
            train: self.train.normalized(mean, std)?,
            validation: self.validation.normalized(mean, std)?,
            test: self.test.normalized(mean, std)?,
        })
    }

    /// Synthetic block splits, already normalised with their own statistics
    pub fn synthetic(
        train: usize,
        test: usize,
        image_size: usize,
        num_classes: usize,
        seed: u64,
        device: &Device,
    ) -> GtnResult<(Self, (f64, f64))> {
        let train_set =
            ImageDataset::synthetic_blocks(train, image_size, num_classes, 0.3, seed, device)?;
        let test_set = ImageDataset::synthetic_blocks(
            test,
            image_size,
            num_classes,
            0.3,
            seed.wrapping_add(1),
            device,
        )?;
        let stats = train_set.statistics()?;
        let splits = Self::from_train_test(train_set, test_set, 0.2)?.normalized(stats.0, stats.1)?;
        Ok((splits, stats))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DATA LOADER
// ═══════════════════════════════════════════════════════════════════════════

/// Mini-batch iterator over an [`ImageDataset`]
pub struct DataLoader {
    dataset: ImageDataset,
    batch_size: usize,
    order: Vec<u32>,
    position: usize,
    shuffle: bool,
    drop_last: bool,
    epoch: usize,
    rng: StdRng,
}

impl DataLoader {
    pub fn new(dataset: ImageDataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        let order = (0..dataset.len() as u32).collect();
        let mut loader = Self {
            dataset,
            batch_size: batch_size.max(1),
            order,
            position: 0,
            shuffle,
            drop_last: true,
            epoch: 0,
            rng: StdRng::seed_from_u64(seed),
        };
        loader.reset();
        loader
    }

    /// Keep a short final batch instead of dropping it
    pub fn keep_last(mut self) -> Self {
        self.drop_last = false;
        self
    }

    /// Rewind to the start of a new epoch
    pub fn reset(&mut self) {
        self.position = 0;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    pub fn len(&self) -> usize {
        let n = self.dataset.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Next batch of the current epoch, `None` at the end
    pub fn next_batch(&mut self) -> GtnResult<Option<(Tensor, Tensor)>> {
        let n = self.order.len();
        let remaining = n.saturating_sub(self.position);
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return Ok(None);
        }
        let end = (self.position + self.batch_size).min(n);
        let batch = self.dataset.select(&self.order[self.position..end])?;
        self.position = end;
        Ok(Some(batch))
    }

    /// Next batch, starting a new epoch whenever the current one runs out
    pub fn next_cycling(&mut self) -> GtnResult<(Tensor, Tensor)> {
        if let Some(batch) = self.next_batch()? {
            return Ok(batch);
        }
        self.epoch += 1;
        self.reset();
        log::debug!("DataLoader epoch {}", self.epoch);
        self.next_batch()?.ok_or_else(|| {
            GtnError::DataExhausted(format!(
                "dataset of {} rows cannot fill a batch of {}",
                self.dataset.len(),
                self.batch_size
            ))
        })
    }
}

/// One epoch of batches. Iteration ends early, with a warning, if a batch
/// cannot be gathered; use [`DataLoader::next_batch`] to see the error.
impl Iterator for DataLoader {
    type Item = (Tensor, Tensor);

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Ok(batch) => batch,
            Err(e) => {
                log::warn!("DataLoader stopped at row {}: {}", self.position, e);
                None
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// IDX ARCHIVES
// ═══════════════════════════════════════════════════════════════════════════

fn read_maybe_gz(path: &Path) -> GtnResult<Vec<u8>> {
    let mut file = File::open(path)
        .map_err(|e| GtnError::Io(format!("Failed to open {:?}: {}", path, e)))?;
    let mut bytes = Vec::new();
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        GzDecoder::new(file).read_to_end(&mut bytes)?;
    } else {
        file.read_to_end(&mut bytes)?;
    }
    Ok(bytes)
}

fn read_u32_be(bytes: &[u8], offset: usize) -> GtnResult<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| GtnError::SerializationError("truncated IDX header".to_string()))
}

/// Parse an IDX image file into `(N, 1, H, W)` pixels scaled to `[0, 1]`
pub fn parse_idx_images(bytes: &[u8], device: &Device) -> GtnResult<Tensor> {
    if read_u32_be(bytes, 0)? != IDX_IMAGES_MAGIC {
        return Err(GtnError::SerializationError("bad IDX image magic".to_string()));
    }
    let n = read_u32_be(bytes, 4)? as usize;
    let rows = read_u32_be(bytes, 8)? as usize;
    let cols = read_u32_be(bytes, 12)? as usize;
    let expected = n
        .checked_mul(rows)
        .and_then(|v| v.checked_mul(cols))
        .ok_or_else(|| {
            GtnError::SerializationError(format!(
                "IDX image header {}x{}x{} overflows",
                n, rows, cols
            ))
        })?;
    let body = &bytes[16..];
    if body.len() < expected {
        return Err(GtnError::SerializationError(format!(
            "IDX image body has {} bytes, expected {}",
            body.len(),
            expected
        )));
    }
    let pixels: Vec<f32> = body[..expected]
        .iter()
        .map(|&b| b as f32 / 255.0)
        .collect();
    Ok(Tensor::from_vec(pixels, (n, 1, rows, cols), device)?)
}

/// Parse an IDX label file into `(N)` u32 labels
pub fn parse_idx_labels(bytes: &[u8], device: &Device) -> GtnResult<Tensor> {
    if read_u32_be(bytes, 0)? != IDX_LABELS_MAGIC {
        return Err(GtnError::SerializationError("bad IDX label magic".to_string()));
    }
    let n = read_u32_be(bytes, 4)? as usize;
    let body = &bytes[8..];
    if body.len() < n {
        return Err(GtnError::SerializationError(format!(
            "IDX label body has {} bytes, expected {}",
            body.len(),
            n
        )));
    }
    let labels: Vec<u32> = body[..n].iter().map(|&b| b as u32).collect();
    Ok(Tensor::from_vec(labels, n, device)?)
}

fn find_archive(dir: &Path, stem: &str) -> GtnResult<PathBuf> {
    for candidate in [stem.to_string(), format!("{}.gz", stem)] {
        let path = dir.join(candidate);
        if path.exists() {
            return Ok(path);
        }
    }
    Err(GtnError::Io(format!("{} not found in {:?}", stem, dir)))
}

/// Load the four standard MNIST IDX files from `dir` as `(train, test)`
pub fn load_mnist_dir(dir: impl AsRef<Path>, device: &Device) -> GtnResult<(ImageDataset, ImageDataset)> {
    let dir = dir.as_ref();
    let load = |images: &str, labels: &str| -> GtnResult<ImageDataset> {
        let images = parse_idx_images(&read_maybe_gz(&find_archive(dir, images)?)?, device)?;
        let labels = parse_idx_labels(&read_maybe_gz(&find_archive(dir, labels)?)?, device)?;
        ImageDataset::new(images, labels, 10)
    };
    let train = load("train-images-idx3-ubyte", "train-labels-idx1-ubyte")?;
    let test = load("t10k-images-idx3-ubyte", "t10k-labels-idx1-ubyte")?;
    log::info!(
        "Loaded MNIST from {:?}: {} train / {} test",
        dir,
        train.len(),
        test.len()
    );
    Ok((train, test))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn idx_images(n: u32, rows: u32, cols: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IDX_IMAGES_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&n.to_be_bytes());
        bytes.extend_from_slice(&rows.to_be_bytes());
        bytes.extend_from_slice(&cols.to_be_bytes());
        bytes.extend((0..n * rows * cols).map(|i| (i % 256) as u8));
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IDX_LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    #[test]
    fn test_synthetic_blocks_labels_cycle() {
        let ds = ImageDataset::synthetic_blocks(25, 8, 10, 0.0, 0, &Device::Cpu).unwrap();
        assert_eq!(ds.len(), 25);
        let labels: Vec<u32> = ds.labels().to_vec1().unwrap();
        assert_eq!(labels[0], 0);
        assert_eq!(labels[13], 3);

        // without noise, exactly one 2x2 block is lit
        let lit: f32 = ds.images().i(0).unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(lit, 4.0);
    }

    #[test]
    fn test_synthetic_rejects_too_many_classes() {
        assert!(ImageDataset::synthetic_blocks(10, 4, 10, 0.0, 0, &Device::Cpu).is_err());
    }

    #[test]
    fn test_normalized_statistics() {
        let ds = ImageDataset::synthetic_blocks(50, 8, 10, 0.2, 1, &Device::Cpu).unwrap();
        let (mean, std) = ds.statistics().unwrap();
        let (m2, s2) = ds.normalized(mean, std).unwrap().statistics().unwrap();
        assert!(m2.abs() < 1e-3);
        assert!((s2 - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_splits_hold_out_validation() {
        let train = ImageDataset::synthetic_blocks(100, 8, 10, 0.1, 0, &Device::Cpu).unwrap();
        let test = ImageDataset::synthetic_blocks(20, 8, 10, 0.1, 1, &Device::Cpu).unwrap();
        let splits = DatasetSplits::from_train_test(train, test, 0.1).unwrap();
        assert_eq!(splits.train.len(), 90);
        assert_eq!(splits.validation.len(), 10);
        assert_eq!(splits.test.len(), 20);
    }

    #[test]
    fn test_loader_drop_last_and_cycle() {
        let ds = ImageDataset::synthetic_blocks(25, 8, 10, 0.1, 0, &Device::Cpu).unwrap();
        let mut loader = DataLoader::new(ds, 10, true, 3);
        assert_eq!(loader.len(), 2);

        let batches: Vec<_> = (&mut loader).collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0.dims(), &[10, 1, 8, 8]);

        let (images, labels) = loader.next_cycling().unwrap();
        assert_eq!(images.dim(0).unwrap(), 10);
        assert_eq!(labels.dim(0).unwrap(), 10);
        assert_eq!(loader.epoch(), 1);
    }

    #[test]
    fn test_loader_keep_last() {
        let ds = ImageDataset::synthetic_blocks(25, 8, 10, 0.1, 0, &Device::Cpu).unwrap();
        let loader = DataLoader::new(ds, 10, false, 0).keep_last();
        assert_eq!(loader.len(), 3);
        let sizes: Vec<usize> = loader.map(|(x, _)| x.dim(0).unwrap()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[test]
    fn test_loader_iteration_stops_on_bad_batch() {
        let ds = ImageDataset::synthetic_blocks(20, 8, 10, 0.1, 0, &Device::Cpu).unwrap();
        let mut loader = DataLoader::new(ds, 10, false, 0);
        loader.order[15] = 99;
        let batches: Vec<_> = loader.by_ref().collect();
        assert_eq!(batches.len(), 1);
        assert!(loader.next_batch().is_err());
    }

    #[test]
    fn test_loader_too_small_dataset() {
        let ds = ImageDataset::synthetic_blocks(5, 8, 5, 0.1, 0, &Device::Cpu).unwrap();
        let mut loader = DataLoader::new(ds, 10, false, 0);
        assert!(matches!(
            loader.next_cycling(),
            Err(GtnError::DataExhausted(_))
        ));
    }

    #[test]
    fn test_parse_idx() {
        let images = parse_idx_images(&idx_images(3, 4, 4), &Device::Cpu).unwrap();
        assert_eq!(images.dims(), &[3, 1, 4, 4]);
        let labels = parse_idx_labels(&idx_labels(&[7, 1, 9]), &Device::Cpu).unwrap();
        assert_eq!(labels.to_vec1::<u32>().unwrap(), vec![7, 1, 9]);
        assert!(parse_idx_labels(&idx_images(1, 1, 1), &Device::Cpu).is_err());
    }

    #[test]
    fn test_parse_idx_rejects_oversized_header() {
        let mut bytes = IDX_IMAGES_MAGIC.to_be_bytes().to_vec();
        for _ in 0..3 {
            bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        }
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            parse_idx_images(&bytes, &Device::Cpu),
            Err(GtnError::SerializationError(_))
        ));
    }

    #[test]
    fn test_load_mnist_dir_gz() {
        let dir = tempfile::tempdir().unwrap();
        let write_gz = |name: &str, bytes: &[u8]| {
            let file = File::create(dir.path().join(name)).unwrap();
            let mut enc = GzEncoder::new(file, Compression::default());
            enc.write_all(bytes).unwrap();
            enc.finish().unwrap();
        };
        write_gz("train-images-idx3-ubyte.gz", &idx_images(4, 8, 8));
        write_gz("train-labels-idx1-ubyte.gz", &idx_labels(&[0, 1, 2, 3]));
        std::fs::write(dir.path().join("t10k-images-idx3-ubyte"), idx_images(2, 8, 8)).unwrap();
        std::fs::write(dir.path().join("t10k-labels-idx1-ubyte"), idx_labels(&[4, 5])).unwrap();

        let (train, test) = load_mnist_dir(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(train.len(), 4);
        assert_eq!(test.len(), 2);
        assert_eq!(train.image_size(), 8);
    }
}
