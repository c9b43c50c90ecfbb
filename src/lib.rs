//! # Heatmap Landmarks
//!
//! Landmark localisation by Gaussian heatmap regression with deep
//! supervision, built on the Burn ML framework.
//!
//! ## Modules
//!
//! - [`heatmap`]: Gaussian encode/decode, coordinate rescaling, label pyramids
//! - [`data`]: Sample sources, keypoint augmentation, dataset and batching
//! - [`model`]: Multi-resolution network, deep-supervision losses, learnable sigmas
//! - [`training`]: Epoch loop, loss scaling, schedules, run state, prediction
//! - [`checkpoint`]: Atomic checkpoint persistence and restore
//! - [`config`]: TOML configuration loading and validation
//! - [`error`]: Structured error types

#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod heatmap;
pub mod model;
pub mod training;
