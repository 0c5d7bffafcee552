use std::{path::Path, sync::Arc};

use candle_core::{DType, Device, Tensor};
use futures::future::BoxFuture;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{error::to_runtime_error, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Batch returned by dataset loaders.
#[derive(Debug, Clone)]
pub struct DataBatch {
    /// `[B, C, H, W]` f32 images.
    pub images: Tensor,
    /// `[B]` u32 class indices.
    pub labels: Tensor,
    /// Loader pass this batch was drawn from, starting at 0.
    pub pass: usize,
    /// Position of the batch within its pass.
    pub index: usize,
}

impl DataBatch {
    pub fn batch_size(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }
}

/// Asynchronous-compatible loader abstraction.
///
/// `next_batch` yields `Ok(None)` once the current pass is exhausted; errors
/// are reserved for genuine failures.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>>;

    /// Rewinds to the beginning of a fresh pass.
    fn start_pass(&mut self) -> Result<()>;
}

impl<L> DataLoader for Box<L>
where
    L: DataLoader + ?Sized,
{
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
        (**self).next_batch()
    }

    fn start_pass(&mut self) -> Result<()> {
        (**self).start_pass()
    }
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn next_batch(&mut self) -> Result<Option<DataBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn start_pass(&mut self) -> Result<()> {
        self.inner.start_pass()
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

/// Turns a finite, pass-based loader into an endless batch stream.
pub struct CyclicBatchProvider<L>
where
    L: DataLoader,
{
    loader: BlockingDataLoader<L>,
}

impl<L> CyclicBatchProvider<L>
where
    L: DataLoader,
{
    pub fn new(loader: L) -> Self {
        Self {
            loader: BlockingDataLoader::new(loader),
        }
    }

    /// Next batch, starting a new pass whenever the current one runs out.
    pub fn next(&mut self) -> Result<DataBatch> {
        if let Some(batch) = self.loader.next_batch()? {
            return Ok(batch);
        }

        self.loader.start_pass()?;
        match self.loader.next_batch()? {
            Some(batch) => Ok(batch),
            None => Err(TrainingError::data(
                "loader produced an empty pass; no batches available",
            )),
        }
    }

    pub fn into_inner(self) -> L {
        self.loader.into_inner()
    }
}

/// In-memory image dataset: `images [N, C, H, W]` and `labels [N]`.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    images: Tensor,
    labels: Tensor,
}

impl TensorDataset {
    pub fn new(images: Tensor, labels: Tensor) -> Result<Self> {
        let dims = images.dims();
        if dims.len() != 4 {
            return Err(TrainingError::data(format!(
                "images must be [N, C, H, W], got {:?}",
                dims
            )));
        }
        if labels.dims() != [dims[0]] {
            return Err(TrainingError::data(format!(
                "labels shape {:?} does not match {} images",
                labels.dims(),
                dims[0]
            )));
        }
        if dims[0] == 0 {
            return Err(TrainingError::data("dataset holds no samples"));
        }

        let images = images.to_dtype(DType::F32).map_err(to_runtime_error)?;
        let labels = match labels.dtype() {
            DType::U32 => labels,
            DType::I64 => {
                let values = labels.to_vec1::<i64>().map_err(to_runtime_error)?;
                if let Some(bad) = values.iter().find(|&&v| v < 0 || v > u32::MAX as i64) {
                    return Err(TrainingError::data(format!("invalid label {bad}")));
                }
                labels.to_dtype(DType::U32).map_err(to_runtime_error)?
            }
            DType::U8 => labels.to_dtype(DType::U32).map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::data(format!(
                    "unsupported label dtype {:?}",
                    dtype
                )))
            }
        };

        Ok(Self { images, labels })
    }

    /// Loads `images` and `labels` tensors from a safetensors file.
    pub fn from_safetensors(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TrainingError::configuration(format!(
                "dataset '{}' does not exist",
                path.display()
            )));
        }
        let mut tensors = candle_core::safetensors::load(path, device).map_err(|err| {
            TrainingError::data(format!("failed to read '{}': {err}", path.display()))
        })?;
        let images = tensors.remove("images").ok_or_else(|| {
            TrainingError::data(format!("'{}' has no 'images' tensor", path.display()))
        })?;
        let labels = tensors.remove("labels").ok_or_else(|| {
            TrainingError::data(format!("'{}' has no 'labels' tensor", path.display()))
        })?;
        Self::new(images, labels)
    }

    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn check_labels(&self, num_classes: usize) -> Result<()> {
        let labels = self.labels.to_vec1::<u32>().map_err(to_runtime_error)?;
        if let Some(bad) = labels.iter().find(|&&label| label as usize >= num_classes) {
            return Err(TrainingError::data(format!(
                "label {bad} out of range for {num_classes} classes"
            )));
        }
        Ok(())
    }

    fn gather(&self, indices: &[u32]) -> Result<(Tensor, Tensor)> {
        let index = Tensor::from_slice(indices, indices.len(), self.images.device())
            .map_err(to_runtime_error)?;
        let images = self.images.index_select(&index, 0).map_err(to_runtime_error)?;
        let labels = self.labels.index_select(&index, 0).map_err(to_runtime_error)?;
        Ok((images, labels))
    }
}

/// Batches a [`TensorDataset`] pass by pass, reshuffling at each new pass.
///
/// The trailing partial batch of a pass is kept.
pub struct ShuffledBatchLoader {
    dataset: Arc<TensorDataset>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    order: Vec<u32>,
    cursor: usize,
    pass: usize,
    index: usize,
}

impl ShuffledBatchLoader {
    pub fn new(
        dataset: Arc<TensorDataset>,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        let mut loader = Self {
            order: (0..dataset.len() as u32).collect(),
            dataset,
            batch_size,
            shuffle,
            seed,
            cursor: 0,
            pass: 0,
            index: 0,
        };
        loader.reorder();
        Ok(loader)
    }

    fn reorder(&mut self) {
        self.order = (0..self.dataset.len() as u32).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.pass as u64));
            self.order.shuffle(&mut rng);
        }
    }

    fn build_batch(&mut self) -> Result<Option<DataBatch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let (images, labels) = self.dataset.gather(&self.order[self.cursor..end])?;
        let batch = DataBatch {
            images,
            labels,
            pass: self.pass,
            index: self.index,
        };
        self.cursor = end;
        self.index += 1;
        Ok(Some(batch))
    }
}

impl DataLoader for ShuffledBatchLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
        Box::pin(async move { self.build_batch() })
    }

    fn start_pass(&mut self) -> Result<()> {
        self.pass += 1;
        self.cursor = 0;
        self.index = 0;
        self.reorder();
        log::debug!("data pass {} started ({} samples)", self.pass, self.order.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(samples: usize) -> Result<Arc<TensorDataset>> {
        let device = Device::Cpu;
        let images = Tensor::arange(0f32, (samples * 2 * 2) as f32, &device)
            .and_then(|t| t.reshape((samples, 1, 2, 2)))
            .map_err(to_runtime_error)?;
        let labels: Vec<u32> = (0..samples as u32).map(|i| i % 2).collect();
        let labels = Tensor::from_vec(labels, samples, &device).map_err(to_runtime_error)?;
        Ok(Arc::new(TensorDataset::new(images, labels)?))
    }

    #[test]
    fn wraps_into_a_new_pass() -> Result<()> {
        let samples = 10;
        let batch_size = 4;
        let loader = ShuffledBatchLoader::new(dataset(samples)?, batch_size, true, 7)?;
        let mut provider = CyclicBatchProvider::new(loader);

        let first = provider.next()?;
        assert_eq!(first.pass, 0);
        let per_pass = samples.div_ceil(batch_size);
        let mut last = first.clone();
        for _ in 1..=per_pass {
            last = provider.next()?;
        }
        assert_eq!(last.pass, first.pass + 1);
        assert_eq!(last.index, 0);
        assert_eq!(last.batch_size(), batch_size);
        Ok(())
    }

    #[test]
    fn keeps_partial_tail_batch() -> Result<()> {
        let mut loader = BlockingDataLoader::new(ShuffledBatchLoader::new(dataset(5)?, 2, false, 0)?);
        let sizes: Vec<usize> = std::iter::from_fn(|| loader.next_batch().ok().flatten())
            .map(|batch| batch.batch_size())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        Ok(())
    }

    #[test]
    fn passes_are_reshuffled() -> Result<()> {
        let data = dataset(16)?;
        let mut loader = ShuffledBatchLoader::new(data, 16, true, 3)?;
        let first = futures::executor::block_on(loader.next_batch())?
            .ok_or_else(|| TrainingError::data("missing batch"))?
            .labels
            .to_vec1::<u32>()
            .map_err(to_runtime_error)?;
        let first_order = loader.order.clone();
        loader.start_pass()?;
        assert_ne!(first_order, loader.order);
        assert_eq!(first.len(), 16);
        Ok(())
    }

    struct FailingLoader {
        remaining: usize,
    }

    impl DataLoader for FailingLoader {
        fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
            Box::pin(async move {
                if self.remaining == 0 {
                    return Err(TrainingError::data("corrupt record"));
                }
                self.remaining -= 1;
                let device = Device::Cpu;
                Ok(Some(DataBatch {
                    images: Tensor::zeros((1, 1, 1, 1), DType::F32, &device)
                        .map_err(to_runtime_error)?,
                    labels: Tensor::zeros(1, DType::U32, &device).map_err(to_runtime_error)?,
                    pass: 0,
                    index: 0,
                }))
            })
        }

        fn start_pass(&mut self) -> Result<()> {
            panic!("a failure must not be treated as the end of a pass");
        }
    }

    #[test]
    fn loader_errors_propagate() {
        let mut provider = CyclicBatchProvider::new(FailingLoader { remaining: 1 });
        assert!(provider.next().is_ok());
        match provider.next() {
            Err(TrainingError::Data(message)) => assert!(message.contains("corrupt")),
            other => panic!("expected data error, got {other:?}"),
        }
    }

    struct EmptyLoader;

    impl DataLoader for EmptyLoader {
        fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
            Box::pin(async { Ok(None) })
        }

        fn start_pass(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn empty_pass_is_an_error() {
        let mut provider = CyclicBatchProvider::new(EmptyLoader);
        assert!(matches!(provider.next(), Err(TrainingError::Data(_))));
    }

    #[test]
    fn rejects_out_of_range_labels() -> Result<()> {
        let data = dataset(4)?;
        assert!(data.check_labels(2).is_ok());
        assert!(data.check_labels(1).is_err());
        Ok(())
    }
}
