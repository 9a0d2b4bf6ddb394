//! Scripted provider mocks

mod model;

pub use model::{extraction_reply, MockModel};
