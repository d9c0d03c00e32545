use thiserror::Error;

/// Implementation of a visual bag-of-words vocabulary,
/// which provides the main functionality of this crate.
pub mod vocab;
pub use vocab::{NodePath, Vocabulary, VocabularyParams, WeightingType};

/// Sparse bag-of-words and direct-index vectors.
pub mod bow;
pub use bow::{BowVector, FeatureVector, LNorm, SharedWords};

/// Similarity metrics between bag-of-words vectors.
pub mod scoring;
pub use scoring::{Scoring, ScoringType};

/// Binary descriptor operations: distance, mean and serialization.
pub mod desc;
pub use desc::{DescriptorOps, Orb};

/// Hierarchical k-means used to grow the vocabulary tree.
///
/// Children of a node are grown in parallel, each from a seed derived from
/// its parent's, so the tree depends only on the corpus and the root seed.
pub mod cluster;
pub use cluster::CancelToken;

/// Inverted-index image database.
pub mod database;
pub use database::{Database, DatabaseParams, Posting, QueryResult};

mod raw;

/// Default descriptor type is a 256-bit binary array.
///
/// This is the most commonly used keypoint descriptor data type.
/// It is used by ORB and BRIEF, for example.
pub type Desc = [u8; 32];

/// Index of a leaf (word) of the vocabulary tree, dense from 0.
pub type WordId = u32;

/// Weight of a word in a [`BowVector`].
pub type WordValue = f64;

/// Index of any node of the vocabulary tree; the root is 0.
pub type NodeId = u32;

/// Id of an image added to a [`Database`], dense from 0.
pub type EntryId = u32;

pub type BowResult<T> = std::result::Result<T, BowErr>;

#[derive(Error, Debug)]
pub enum BowErr {
    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "bincode")]
    #[error("Database Serialization Error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Malformed vocabulary data: {0}")]
    Format(String),
    #[error("Vocabulary is not trained")]
    NotTrained,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Training cancelled")]
    Cancelled,
}
