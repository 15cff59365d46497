pub mod checkpoint_repository;
pub mod config;
pub mod database;
pub mod enrichment_repository;
pub mod failure_repository;
pub mod run_repository;
pub mod subject_repository;

pub use checkpoint_repository::CheckpointRepository;
pub use config::DatabaseConfig;
pub use database::Database;
pub use enrichment_repository::EnrichmentRepository;
pub use failure_repository::FailureRepository;
pub use run_repository::RunRepository;
pub use subject_repository::SubjectRepository;
