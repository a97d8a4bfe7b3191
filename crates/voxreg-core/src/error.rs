/// Why a sample failed validation before it was yielded.
///
/// Carried inside [`Error::Validation`] together with the identifying
/// indices of the offending sample.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// The moving or fixed image was not provided.
    #[error("moving image and fixed image must both be present")]
    MissingImage,

    /// Exactly one of the two labels was provided.
    #[error("moving label and fixed label must be both present or both absent")]
    LabelPresenceMismatch,

    /// An array holds a value outside the valid range (NaN included).
    #[error(
        "{name} has normalized value outside of [{low}, {high}]; images are assumed \
         to be scaled from the configured input range and labels to be binary"
    )]
    ValueOutOfRange {
        name: &'static str,
        low: f32,
        high: f32,
    },

    /// An image array is not 3-dimensional.
    #[error("{name}'s shape should have dimension of 3, got {shape:?}")]
    ImageRank {
        name: &'static str,
        shape: Vec<usize>,
    },

    /// A label array is neither 3- nor 4-dimensional.
    #[error("{name}'s shape should have dimension of 3 or 4, got {shape:?}")]
    LabelRank {
        name: &'static str,
        shape: Vec<usize>,
    },

    /// Moving and fixed labels carry a different number of channels.
    #[error(
        "moving and fixed labels have different numbers of labels: moving {moving}, fixed {fixed}"
    )]
    LabelChannelMismatch { moving: usize, fixed: usize },

    /// A fixed label-channel policy points past the last channel.
    #[error("label index {index} out of range for {num_labels} label channels")]
    LabelIndexOutOfRange { index: usize, num_labels: usize },
}

/// All errors that can occur within voxreg.
///
/// Construction errors (shapes, backend wiring, group structure) are raised
/// before any sampling starts. Validation and backend errors end the epoch
/// pass they occur in.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An image shape did not have exactly three non-zero dimensions.
    #[error(
        "image shape has to be three non-zero extents, corresponding to \
         (width, height, depth), got {got:?}"
    )]
    InvalidShape { got: Vec<usize> },

    /// A concatenated loader was built from an empty list.
    #[error("concatenated data loader needs at least one child loader")]
    EmptyLoaderList,

    /// Only one of the moving/fixed label backends was provided.
    #[error("moving label and fixed label backends must be both provided or both omitted")]
    LabelBackendMismatch,

    /// Two backends that must be aligned report different image counts.
    #[error("{left} has {left_count} images but {right} has {right_count}")]
    ImageCountMismatch {
        left: String,
        left_count: usize,
        right: String,
        right_count: usize,
    },

    /// Two backends that must be aligned report different data ids.
    #[error("data ids of {left} and {right} do not match")]
    DataIdMismatch { left: String, right: String },

    /// One or more groups of a grouped backend have no samples.
    #[error("groups of ID {group_ids:?} are empty")]
    EmptyGroups { group_ids: Vec<String> },

    /// Grouped sampling options are inconsistent with each other or the data.
    #[error("grouped sampling: {0}")]
    GroupedSampling(String),

    /// Preprocessing parameters are inconsistent.
    #[error("invalid preprocessing configuration: {0}")]
    Configuration(String),

    /// A sample violated the value/shape contract.
    #[error("sample {indices:?}: {kind}")]
    Validation {
        indices: Vec<i64>,
        kind: ValidationError,
    },

    /// The backend does not implement an optional capability.
    #[error("{backend} does not support {operation}")]
    Unsupported {
        backend: String,
        operation: &'static str,
    },

    /// A data index does not address any entry of the backend.
    #[error("index {index} out of range for {backend}")]
    IndexOutOfRange { backend: String, index: String },

    /// Backend-specific failure while reading data.
    #[error("backend {backend}: {message}")]
    Backend { backend: String, message: String },

    /// The loader was used after `close()`.
    #[error("data loader has been closed")]
    Closed,

    /// One or more backends failed to close.
    #[error("failed to close {} resource(s): {}", .failures.len(), join_messages(.failures))]
    Close { failures: Vec<Error> },

    /// Records could not be stacked into a batch.
    #[error("cannot collate batch: {0}")]
    Collate(String),

    /// Array construction failed.
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Wrap a validation failure with the sample's identifying indices.
    pub fn validation(indices: &[i64], kind: ValidationError) -> Self {
        Error::Validation {
            indices: indices.to_vec(),
            kind,
        }
    }

    /// Fold a list of close failures into a single result.
    pub fn from_close_failures(mut failures: Vec<Error>) -> Result<()> {
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(Error::Close { failures }),
        }
    }
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience Result type used throughout voxreg.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_carries_indices() {
        let err = Error::validation(&[3, 4, -1], ValidationError::MissingImage);
        let text = err.to_string();
        assert!(text.contains("[3, 4, -1]"), "{text}");
        assert!(text.contains("must both be present"), "{text}");
    }

    #[test]
    fn single_close_failure_is_not_wrapped() {
        let err = Error::from_close_failures(vec![Error::msg("disk gone")]).unwrap_err();
        assert!(matches!(err, Error::Msg(_)));
    }

    #[test]
    fn several_close_failures_are_aggregated() {
        let err = Error::from_close_failures(vec![Error::msg("a"), Error::msg("b")]).unwrap_err();
        match err {
            Error::Close { failures } => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(Error::from_close_failures(Vec::new()).is_ok());
    }
}
