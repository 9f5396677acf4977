//! oswizard library
//!
//! Core functionality of the guided OS installer wizard: the reactive
//! configuration store, the page-flow state machine and the installation
//! scripting pipeline. Widget rendering, translation lookup and device
//! enumeration live outside this crate and talk to it through the store.

pub mod cli;
pub mod config_file;
pub mod envvars;
pub mod error;
pub mod navigation;
pub mod pages;
pub mod preload;
pub mod process_guard;
pub mod scripting;
pub mod store;
pub mod terminal;

// Re-export main types for convenience
pub use config_file::{InstallerConfig, Loaded, RunMode, Scripts};
pub use error::{Result, WizardError};
pub use navigation::{Navigation, TransitionEffect};
pub use pages::{Page, PageAvailabilityResolver, PAGE_ORDER};
pub use preload::PreloadPool;
pub use process_guard::{ChildRegistry, ProcessGuard};
pub use scripting::{CancelToken, InstallationPipeline, Stage};
pub use store::{Dispatch, Key, OwnerId, PageRequest, Store, SubscriptionId, Value};
pub use terminal::TerminalSink;
