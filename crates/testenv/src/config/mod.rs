//! Configuration document parsing, placeholder resolution and file writers

mod document;
mod variables;
pub mod writers;

pub use document::*;
pub use variables::*;
