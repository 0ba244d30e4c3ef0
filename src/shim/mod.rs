mod args;
mod decode;
mod executor;
mod registry;
mod reply;
mod worker;

pub use registry::{Registry, RegistrySettings};
