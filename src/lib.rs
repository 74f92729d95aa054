// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! DeepTrack: multispectral target recognition backend
//!
//! Uploaded imagery is handed to an external vision model, whose free-form
//! replies are normalized into detections and stored alongside the files and
//! analysis jobs that produced them.

pub mod analysis;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod storage;
pub mod web;

pub use config::AppConfig;
pub use error::{DeepTrackError, Result};
