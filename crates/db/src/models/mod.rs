pub mod job;
pub mod status;
pub mod token;
pub mod user;
