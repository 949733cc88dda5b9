//! Service layer: orchestration that sits between routes and collaborators.

pub mod image_service;

pub use image_service::{
    etag_matches, parse_query, ImageService, ImageServiceConfig, MintRequest, MintResponse,
    ServeOutcome,
};
