//! Core types for codeloop.

pub mod generation;
pub mod item;
pub mod stream;

pub use generation::*;
pub use item::*;
pub use stream::*;
