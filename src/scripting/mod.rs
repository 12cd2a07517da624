pub mod api;
pub mod context;
pub mod diagnostic;
pub mod handles;
pub mod sandbox;
