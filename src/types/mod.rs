//! Shared type definitions
//!
//! This module contains all shared data types used across the crate.

pub mod config;
pub mod message;
pub mod model;

pub use config::AppConfig;
pub use message::{
    GenerationMetrics, GenerationParams, GenerationRequest, GenerationResponse, Message, RequestError, Role,
};
pub use model::{ModelDescriptor, ModelFormat};
