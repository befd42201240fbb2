//! Repository layer: one zero-sized struct per table with async functions
//! that take a `&PgPool`.

pub mod case_repo;
pub mod queue_repo;
pub mod run_repo;

pub use case_repo::CaseRepo;
pub use queue_repo::QueueRepo;
pub use run_repo::RunRepo;
