pub mod config;
pub mod database;
pub mod staging_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use staging_repository::StagingRepository;
