#![doc = include_str!("../README.md")]

// -----------------------------------------------------------------------------
// Modules

mod error;
mod reader;
mod time;
mod token;
mod value;
mod writer;

// -----------------------------------------------------------------------------
// Top-level exports

pub use error::{WireError, WireResult};
pub use reader::StreamReader;
pub use time::{DateKind, TICKS_PER_SECOND, UNIX_EPOCH_TICKS, WireDate};
pub use token::Token;
pub use value::SimpleValue;
pub use writer::StreamWriter;

// -----------------------------------------------------------------------------
// Re-export crates

pub use chrono;
pub use rust_decimal;
pub use uuid;
