pub mod callback;
pub mod job;
pub mod message;
