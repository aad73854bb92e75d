//! Shared utilities across vmbake modules.

pub mod files;
pub mod temp;

pub use files::{append_line_once, remove_if_exists, replace_symlink, write_file_mode, write_file_with_dirs};
pub use temp::{create_scratch_dir, remove_empty_dir};
