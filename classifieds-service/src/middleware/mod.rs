pub mod cold_start;

pub use cold_start::cold_start_middleware;
