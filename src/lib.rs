//! Promotion label extraction
//!
//! This library turns a directory of retail promotion photos into validated
//! structured labels (product name, price, promotion type and arguments) by
//! sending each image to a remote vision model through a rate-limited
//! transport, then merges the labels into a JSONL training file.

pub mod app_state;
pub mod config;
pub mod models;
pub mod services;
