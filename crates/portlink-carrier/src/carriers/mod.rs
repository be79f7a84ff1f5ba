//! Built-in carriers.

pub mod local;
pub mod tcp;
pub mod text;
