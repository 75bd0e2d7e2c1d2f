mod barrier;
mod collector;
mod compactor;
mod error;
mod handles;
mod heap;
mod marker;
mod space;
mod verify;
mod weakmap;

pub use barrier::WriteBarrier;
pub use collector::GcStats;
pub use compactor::{CompactionMode, RecordedSlot, SlotsBuffer};
pub use error::{HeapError, VerifyError};
pub use handles::{
    GlobalHandle, GlobalHandles, HandleScope, HandleState, Local, LocalHandles, WeakCallback,
    WeakCallbackInfo,
};
pub use heap::*;
pub use marker::{Marker, StepResult};
pub use verify::verify_heap;
