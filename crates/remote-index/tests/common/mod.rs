//! Test infrastructure for the remote index service.
//!
//! Fixtures build index messages; the harness owns a file-backed index
//! database and simulates the primary store the FHIR server would write.

#![allow(dead_code)]

pub mod fixtures;
pub mod harness;

pub use fixtures::*;
pub use harness::*;
