//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Build and export a disk image
//! - `show` - Display configuration or partition layout
//! - `preflight` - Run preflight checks
//! - `detach` - Release loop devices leaked by a killed build

pub mod build;
mod detach;
mod preflight;
pub mod show;

pub use build::cmd_build;
pub use detach::cmd_detach;
pub use preflight::cmd_preflight;
pub use show::cmd_show;
