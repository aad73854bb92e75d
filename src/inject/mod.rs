//! First-boot configuration and service enablement.

pub mod files;
pub mod services;

use std::path::Path;

use anyhow::Context;
use tracing::{debug, info};

use crate::config::BuildConfig;
use crate::error::BuildError;

/// Write every first-boot file into the mounted root, then enable the
/// configured services.
pub fn inject(root: &Path, config: &BuildConfig) -> Result<(), BuildError> {
    inject_files(root, config).map_err(BuildError::ConfigInjection)?;

    let links = services::enable_services(root, &config.services)
        .context("Failed to enable services")
        .map_err(BuildError::ConfigInjection)?;
    for link in &links {
        debug!("enabled {}", link.display());
    }
    info!(
        "Enabled {} service(s) ({} links)",
        config.services.len(),
        links.len()
    );
    Ok(())
}

fn inject_files(root: &Path, config: &BuildConfig) -> anyhow::Result<()> {
    files::reset_machine_id(root).context("Failed to reset machine id")?;
    files::write_kernel_cmdline(root, &config.kernel_cmdline())?;
    if config.image_spec().partitions.last().is_some_and(|p| p.auto_grows()) {
        files::write_repart_config(root)?;
    }
    files::write_fstab(root, config)?;
    files::write_identity(root, &config.identity)?;
    files::set_root_shell(root, &config.identity.shell)?;
    files::write_network_config(root, &config.network.interface_pattern)?;
    files::write_ssh_hardening(root)?;
    let added = files::append_shell_hooks(root, &config.shell_hooks)?;
    debug!("appended {} shell hook(s)", added);
    files::create_editor_links(root, &config.editor_links)?;
    info!("Injected first-boot configuration into {}", root.display());
    Ok(())
}
