//! cellar-lib: formula evaluation and build orchestration.
//!
//! This crate turns declarative package descriptions into installed kegs:
//! - `Formula`: sources, options, dependencies, patches and procedures of a package
//! - `ResolvedOptions`: the effective build configuration under user flags
//! - `DependencyGraph`: the acyclic, option-constrained graph of an install request
//! - `Installer`: fetch, patch, build and promote every graph node in parallel waves
//! - `InstallationRecord`: the immutable receipt of an installed keg

pub mod bottle;
pub mod config;
pub mod consts;
pub mod fetch;
pub mod formula;
pub mod graph;
pub mod install;
pub mod layout;
pub mod options;
pub mod patch;
pub mod placeholder;
pub mod platform;
pub mod prefix_lock;
pub mod registry;
pub mod sandbox;
pub mod util;

pub use config::Config;
pub use formula::{Formula, FormulaRegistry};
pub use graph::DependencyGraph;
pub use install::{InstallError, InstallReport, Installer};
pub use layout::InstallationRecord;
pub use options::ResolvedOptions;
pub use platform::PlatformFacts;
