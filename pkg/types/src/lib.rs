//! Objects delivered by the Service / Endpoints event source, and the
//! proxy's configuration file.

pub mod config;
pub mod endpoint;
pub mod service;
pub mod validate;
