//! Frame container codec and storage back ends

pub mod fits;
pub mod http_store;
pub mod storage;

pub use fits::FrameCodec;
pub use http_store::HttpStore;
pub use storage::{intermediate_key, FrameStore, LocalStore, MemoryStore};
