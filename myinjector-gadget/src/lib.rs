//! # myinjector-gadget
//!
//! Renders instrumentation gadget settings into the gadget's own config
//! format and installs the result into an application sandbox.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use myinjector_core::types::GadgetConfig;
//! use myinjector_gadget::render;
//!
//! let text = render(&GadgetConfig::default()).unwrap_or_default();
//! println!("{text}");
//! ```

pub mod error;
pub mod materialize;
pub mod render;

pub use error::GadgetError;
pub use materialize::{config_file_name, materialize, target_path};
pub use render::{parse_preview, render, render_pretty};
