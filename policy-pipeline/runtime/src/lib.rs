#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admin;
mod args;
mod authoring;
mod sweep;

pub use self::{
    admin::Admin,
    args::Args,
    authoring::{AuthoringPipeline, Moved, PipelineError, Removed, Stage, Submitted},
};
