use rustfst::fst_impls::VectorFst;
use rustfst::semirings::{LogWeight, TropicalWeight};

/// rustfst does not define this but we will
pub type StdVectorFst = VectorFst<TropicalWeight>;

/// Log-semiring twin, used for forward weights when sampling paths
pub type LogVectorFst = VectorFst<LogWeight>;

/// Dense index into the lexicon's word list
pub type WordId = usize;

/// A probability; log-domain where an interface says so, linear elsewhere
pub type LmProb = f64;

/// Hard cap on the character length of a single word
pub const MAX_WORD_LEN: usize = 1000;

/// Chinese-restaurant-process table set for one language-model context
pub mod restaurant;

/// Hierarchical Pitman-Yor language model
pub mod pylm;

/// Dynamic lexicon transducer over characters and words
pub mod lexfst;

/// The two language models viewed as a weighted automaton
pub mod pylmfst;

/// Per-sequence resampling: compose, prune, draw a path
pub mod sampler;

/// The blocked Gibbs training loop
pub mod train;

pub use lexfst::LexFst;
pub use pylm::PyLm;
pub use pylmfst::PylmFst;
pub use restaurant::Restaurant;
pub use train::{InputKind, TrainConfig, Trainer};
