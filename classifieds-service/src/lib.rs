//! Classifieds backend: categories, city areas, advertisements and users on
//! MongoDB, with a managed store-connection lifecycle.
pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod utils;
