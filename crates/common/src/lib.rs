// coauthor-common: shared types for the Coauthor workspace

pub mod envelope;
pub mod error;
pub mod origin;
pub mod types;
