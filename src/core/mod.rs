//! Domain types and pure logic shared by every other module.

pub mod recurrence;
pub mod retry;
pub mod schedule;
pub mod task;
pub mod template;
pub mod types;
