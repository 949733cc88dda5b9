//! Request middleware for the htmlshot API.

pub mod auth;

pub use auth::{auth_middleware, bearer_token, AuthExtractor};
