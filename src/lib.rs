//! Kidney biopsy pipeline orchestrator
//!
//! Accepts transplant biopsy jobs over HTTP, hands them to the external
//! machine-learning pipeline through marker files in a shared directory,
//! follows each run on the filesystem, scores the results and produces the
//! pathology report.

pub mod app_state;
pub mod bootstrap;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
