//! Weak collections on a compacting, incrementally marked heap.
//!
//! [`Runtime`] is the embedder surface. The collector itself lives in the
//! `heap` crate and the object model in `object`.

mod runtime;
pub mod scenarios;

pub use heap::{
    GcStats, GlobalHandle, HandleScope, HandleState, Heap, HeapError,
    HeapSettings, StepResult, VerifyError, WeakCallbackInfo,
};
pub use object::{TableSize, Value};
pub use runtime::Runtime;
