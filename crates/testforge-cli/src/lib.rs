//! Project service and command-line front end for testforge.

pub mod cli;
pub mod handlers;
pub mod service;

pub use service::{CreateProject, ProjectService};
