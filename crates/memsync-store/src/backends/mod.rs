//! In-process backends shipped with memsync.

mod document;
mod graph;
mod key_value;
mod vector;

pub use document::DocumentStore;
pub use graph::{GraphStore, Relation};
pub use key_value::KeyValueStore;
pub use vector::{CharSumEmbedder, Embedder, VectorStore};
