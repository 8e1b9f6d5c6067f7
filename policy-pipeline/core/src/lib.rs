#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod catalog;
pub mod distribution;
pub mod drift;
mod environment;
pub mod memory;
pub mod paths;
mod record;

pub use self::{
    catalog::{Catalog, CatalogSnapshot},
    environment::{Environment, EnvironmentLimits, EnvironmentScope, LifecycleStage, ParseError},
    memory::MemoryCatalog,
    record::{Fingerprint, PolicyId, PolicyRecord, RecordError},
};
