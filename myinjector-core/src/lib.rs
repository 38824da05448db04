//! MyInjector core library: document model, engine settings, the privileged
//! command channel, and the configuration store.
//!
//! Public API surface:
//! - [`types`]: the persisted `config.json` document and its parts
//! - [`settings`]: engine settings and the on-device filesystem layout
//! - [`channel`]: [`CommandChannel`] and the `su`-backed [`RootShell`]
//! - [`store`]: [`ConfigStore`]: load-or-default, mutate, persist
//! - [`lockfile`]: the cross-process lock held while `config.json` changes
//! - [`error`]: [`CoreError`], [`StoreError`]

pub mod channel;
pub mod error;
mod lenient;
pub mod lockfile;
pub mod settings;
pub mod store;
pub mod types;

pub use channel::{CommandChannel, CommandOutput, RootShell};
pub use error::{CoreError, StoreError};
pub use settings::{EngineSettings, PrivilegeMode};
pub use store::ConfigStore;
pub use types::{
    AppConfig, GadgetConfig, GadgetMode, InjectionMethod, ModuleConfig, OnLoad, PackageName,
    PayloadFile, PortConflict, StoredPath,
};
