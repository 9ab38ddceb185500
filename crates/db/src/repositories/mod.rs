//! Repository layer: one zero-sized struct per table, each method taking
//! the pool (or a transaction) explicitly.

pub mod allocation_repo;
pub mod job_repo;
pub mod token_pool_repo;
pub mod user_repo;

pub use allocation_repo::AllocationRepo;
pub use job_repo::JobRepo;
pub use token_pool_repo::TokenPoolRepo;
pub use user_repo::UserRepo;
