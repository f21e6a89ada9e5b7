#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

//! # epiclock
//!
//! Biological-age estimation from DNA methylation arrays. The library is organised as a
//! strictly ordered pipeline: matrix loading, cell-composition estimation, tissue
//! adjustment, the epigenetic clock ensemble, percentile and risk computation, and
//! report assembly. The binary in `src/main.rs` drives it from the command line.

pub mod adjust;
pub mod cells;
pub mod config;
pub mod ensemble;
pub mod matrix;
pub mod metadata;
pub mod percentile;
pub mod progress;
pub mod report;
pub mod run;

#[path = "../clocks/mod.rs"]
pub mod clocks;

#[path = "../shared/mod.rs"]
pub mod shared;
