//! Core domain types: identifiers, jobs, recurring definitions, schedules,
//! handlers and retry policy.

pub mod handler;
pub mod job;
pub mod recurring;
pub mod retry;
pub mod schedule;
pub mod types;
