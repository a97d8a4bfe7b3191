// ConcatenatedDataLoader — several loaders behind one stream

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use voxreg_core::{Error, ImageShape, Result};

use crate::loader::{DataLoader, SampleStream};
use crate::sample::Sample;

/// Concatenate two or more loaders end-to-end.
///
/// Shapes are taken from the first loader. Children may differ in labeling
/// and index length, so [`labeled`](DataLoader::labeled) and
/// [`num_indices`](DataLoader::num_indices) are `None`.
pub struct ConcatenatedDataLoader {
    loaders: Vec<Box<dyn DataLoader>>,
    closed: AtomicBool,
}

impl ConcatenatedDataLoader {
    /// Create a concatenation of the given loaders.
    ///
    /// Fails with [`Error::EmptyLoaderList`] if `loaders` is empty.
    pub fn new(loaders: Vec<Box<dyn DataLoader>>) -> Result<Self> {
        if loaders.is_empty() {
            return Err(Error::EmptyLoaderList);
        }
        debug!(num_loaders = loaders.len(), "concatenated data loader ready");
        Ok(Self {
            loaders,
            closed: AtomicBool::new(false),
        })
    }

    pub fn loaders(&self) -> &[Box<dyn DataLoader>] {
        &self.loaders
    }

    fn first(&self) -> &dyn DataLoader {
        // non-empty by construction
        self.loaders[0].as_ref()
    }
}

impl DataLoader for ConcatenatedDataLoader {
    fn moving_image_shape(&self) -> ImageShape {
        self.first().moving_image_shape()
    }

    fn fixed_image_shape(&self) -> ImageShape {
        self.first().fixed_image_shape()
    }

    fn num_samples(&self) -> usize {
        self.loaders.iter().map(|l| l.num_samples()).sum()
    }

    fn labeled(&self) -> Option<bool> {
        None
    }

    fn num_indices(&self) -> Option<usize> {
        None
    }

    fn get_dataset(&self) -> Result<SampleStream<'_>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(Box::new(Chained {
            loaders: &self.loaders,
            next: 0,
            current: None,
            done: false,
        }))
    }

    /// Close every child, even after a failure, and report all failures.
    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let failures: Vec<Error> = self
            .loaders
            .iter()
            .filter_map(|l| l.close().err())
            .collect();
        if !failures.is_empty() {
            warn!(failed = failures.len(), "some child loaders failed to close");
        }
        Error::from_close_failures(failures)
    }
}

/// Streams of the children, one after the other. A child's pass is only
/// started once the previous one is exhausted.
struct Chained<'a> {
    loaders: &'a [Box<dyn DataLoader>],
    next: usize,
    current: Option<SampleStream<'a>>,
    done: bool,
}

impl Iterator for Chained<'_> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Result<Sample>> {
        while !self.done {
            if let Some(stream) = self.current.as_mut() {
                match stream.next() {
                    Some(Ok(s)) => return Some(Ok(s)),
                    Some(Err(e)) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                    None => self.current = None,
                }
            }
            let loader = self.loaders.get(self.next)?;
            self.next += 1;
            match loader.get_dataset() {
                Ok(stream) => self.current = Some(stream),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
