//! Test suite for the training pipeline
//!
//! Most tests drive the loop with a scripted detector whose losses are cheap,
//! deterministic functions of a handful of parameters; `integration_tests`
//! runs a tiny real Mask R-CNN end to end.

mod data_tests;
mod trainer_tests;
