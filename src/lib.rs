#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
#![allow(clippy::match_wildcard_for_single_variants)]
#![allow(clippy::cast_possible_truncation)]

//! # devstack
//!
//! Disposable, reproducible multi-container development stacks for PHP and
//! Python projects.
//!
//! devstack looks at a project directory, works out which services it needs
//! (database, cache, mail catcher) and runs them next to the application in
//! containers, with ports that never collide across projects.
//!
//! ## Pipeline
//!
//! - **Analyze**: [`project::analyze`] classifies a directory into a kind and
//!   feature flags
//! - **Resolve**: [`blueprint::resolve`] maps the project and its
//!   `.devstack.toml` overrides to service roles
//! - **Synthesize**: [`synth::synthesize`] turns the blueprint into a concrete
//!   [`StackPlan`]
//! - **Apply**: [`Orchestrator`] drives a [`ContainerEngine`] and keeps the
//!   [`StateStore`] current
//!
//! ## Quick Start
//!
//! ```bash
//! # Show what would run
//! devstack plan
//!
//! # Start the stack
//! devstack up
//!
//! # Tear it down again
//! devstack down --volumes
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::use_self)]

pub mod blueprint;
pub mod core;
pub mod engine;
pub mod env;
pub mod error;
pub mod lifecycle;
pub mod project;
pub mod store;
pub mod synth;

// Re-export commonly used types
pub use blueprint::{resolve, Overrides, RoleName, StackBlueprint};
pub use core::Config;
pub use engine::{ContainerEngine, DockerCli, EngineError, MemoryEngine};
pub use env::ProjectEnv;
pub use error::{Error, Result};
pub use lifecycle::{CancelToken, Orchestrator, OrchestratorOptions, StatusReport};
pub use project::{analyze, Feature, Project, ProjectKind};
pub use store::{StackRecord, StackStatus, StateStore};
pub use synth::{synthesize, PortAllocation, ServiceInstance, StackPlan, SynthesisContext};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "devstack";
