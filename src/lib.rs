pub mod api;
pub mod config;
pub mod dedupe;
pub mod fingerprint;
pub mod ingest;
pub mod normalize;
pub mod postgres;
pub mod repository;
pub mod store;
