//! rollcall-vision — vision backends for the attendance engine.
//!
//! [`ScrfdDetector`] locates faces with an SCRFD ONNX model; [`LbphBackend`]
//! trains and restores local-binary-pattern appearance classifiers.

pub mod detector;
pub mod lbph;

pub use detector::ScrfdDetector;
pub use lbph::{LbphBackend, LbphModel};
