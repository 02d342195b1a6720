//! Child-process runtime.

pub mod child;

pub use child::{run_if_child, serve, ChildRuntime};
