//! Infrastructure adapters: pipes and line framing.

pub mod ipc;

pub use ipc::{LineReader, LineWriter};
