#![forbid(unsafe_code)]

pub mod demo;
pub mod dry_run;

pub use demo::DemoStream;
pub use dry_run::DryRunConsole;
