pub mod address;
pub mod context;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod mime;
pub mod model;
pub mod status;

pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
