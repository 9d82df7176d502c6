#![doc = include_str!("../README.md")]

pub use gv_engine as engine;
pub use gv_utils as utils;
pub use gv_wire as wire;
