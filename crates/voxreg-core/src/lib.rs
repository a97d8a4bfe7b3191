//! # voxreg-core
//!
//! Primitives shared by the voxreg data layer.
//!
//! This crate provides:
//! - [`Error`] / [`ValidationError`] — the single error type used across voxreg
//! - [`ImageShape`] — the `(width, height, depth)` shape contract of a loader
//! - [`volume`] helpers — value ranges, label channel counting and slicing

pub mod error;
pub mod shape;
pub mod volume;

pub use error::{Error, Result, ValidationError};
pub use shape::ImageShape;
pub use volume::ValueRange;
