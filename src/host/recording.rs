//! A [`Host`] that records what the build asks for instead of doing it.
//!
//! Loop devices, partition nodes, mounts and `qemu-img` are simulated well
//! enough for the whole pipeline to run unprivileged inside a temp dir:
//!
//! - `losetup --find` hands out `/dev/loop7`, `/dev/loop8`, ... and their
//!   `pN` partition nodes become ready at once.
//! - A device mount restores whatever was written to that filesystem the
//!   last time it was mounted, and an unmount moves the target's contents
//!   back out. Pseudo-filesystem contents are dropped on unmount, as with
//!   a real tmpfs.
//! - Failures can be injected per command, mount or unmount.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use tempfile::TempDir;

use super::{Host, Unmounted};
use crate::common::files::{write_file_mode, write_file_with_dirs};
use crate::mount::{MountEntry, MountSource};
use crate::process::{Cmd, CommandResult};

const FIRST_LOOP: u32 = 7;

/// One recorded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOp {
    /// A command line, as displayed by [`Cmd`].
    Run(String),
    Mount(PathBuf),
    Unmount(PathBuf),
}

type RunHook = Box<dyn Fn(&Cmd) -> Result<()> + Send + Sync>;

struct Mounted {
    target: PathBuf,
    /// Where the filesystem's contents live while unmounted.
    store: Option<PathBuf>,
}

#[derive(Default)]
struct State {
    ops: Vec<HostOp>,
    mounted: Vec<Mounted>,
    /// Loop device -> backing file.
    loops: BTreeMap<PathBuf, PathBuf>,
    next_loop: u32,
    failing_commands: Vec<String>,
    failing_mounts: Vec<String>,
    failing_unmounts: Vec<String>,
    busy: HashSet<PathBuf>,
    partitions_hidden: bool,
    /// Converted image -> format it was written as.
    converted: HashMap<PathBuf, String>,
    stores: Option<TempDir>,
}

#[derive(Default)]
pub struct RecordingHost {
    state: Mutex<State>,
    hooks: Mutex<Vec<(String, RunHook)>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the recorded state.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail every command whose displayed command line contains `pattern`.
    pub fn fail_command(&self, pattern: &str) {
        self.state().failing_commands.push(pattern.to_string());
    }

    /// Fail mounts whose target path contains `pattern`.
    pub fn fail_mount(&self, pattern: &str) {
        self.state().failing_mounts.push(pattern.to_string());
    }

    /// Fail unmounts whose target path contains `pattern`. The target stays
    /// mounted.
    pub fn fail_unmount(&self, pattern: &str) {
        self.state().failing_unmounts.push(pattern.to_string());
    }

    /// Report `target` as busy so its unmount goes lazy.
    pub fn mark_busy(&self, target: &Path) {
        self.state().busy.insert(target.to_path_buf());
    }

    /// Never let partition nodes appear.
    pub fn hide_partitions(&self) {
        self.state().partitions_hidden = true;
    }

    /// Run `hook` before simulating every invocation of `program`. A hook
    /// error fails the command.
    pub fn on_run<F>(&self, program: &str, hook: F)
    where
        F: Fn(&Cmd) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((program.to_string(), Box::new(hook)));
    }

    /// Make `debootstrap` lay down a minimal tree with the given units.
    pub fn simulate_debootstrap(&self, units: &[&str]) {
        let units: Vec<String> = units.iter().map(|s| s.to_string()).collect();
        self.on_run("debootstrap", move |cmd| {
            // debootstrap [options] <release> <target> <mirror>
            let args = cmd.get_args();
            let target = args
                .len()
                .checked_sub(2)
                .and_then(|i| args.get(i))
                .ok_or_else(|| anyhow!("debootstrap called without a target"))?;
            let units: Vec<&str> = units.iter().map(String::as_str).collect();
            populate_minimal_tree(Path::new(target), &units)
        });
    }

    pub fn ops(&self) -> Vec<HostOp> {
        self.state().ops.clone()
    }

    /// Every command line run, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state()
            .ops
            .iter()
            .filter_map(|op| match op {
                HostOp::Run(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    /// Mount targets in the order they were mounted.
    pub fn mount_order(&self) -> Vec<PathBuf> {
        self.state()
            .ops
            .iter()
            .filter_map(|op| match op {
                HostOp::Mount(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    /// Unmount targets in the order they were requested.
    pub fn unmounted(&self) -> Vec<PathBuf> {
        self.state()
            .ops
            .iter()
            .filter_map(|op| match op {
                HostOp::Unmount(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    /// Targets currently mounted.
    pub fn mounted(&self) -> Vec<PathBuf> {
        self.state().mounted.iter().map(|m| m.target.clone()).collect()
    }

    /// Loop devices currently attached.
    pub fn attached_loops(&self) -> Vec<PathBuf> {
        self.state().loops.keys().cloned().collect()
    }

    /// Directory holding what was written to a device filesystem, mounted
    /// with `data`, while it is not mounted.
    pub fn filesystem_contents(&self, device: &Path, data: Option<&str>) -> Option<PathBuf> {
        let state = self.state();
        let dir = state.stores.as_ref()?.path().join(store_key(device, data));
        dir.is_dir().then_some(dir)
    }

    fn simulate(&self, cmd: &Cmd) -> Result<String> {
        let args = cmd.get_args();
        match cmd.program() {
            "losetup" => self.simulate_losetup(args),
            "qemu-img" => self.simulate_qemu_img(args),
            _ => Ok(String::new()),
        }
    }

    fn simulate_losetup(&self, args: &[String]) -> Result<String> {
        let mut state = self.state();
        let has = |flag: &str| args.iter().any(|a| a == flag);
        let last = args.last().map(PathBuf::from);

        if has("--find") {
            let backing = last.ok_or_else(|| anyhow!("losetup: no backing file"))?;
            if state.next_loop < FIRST_LOOP {
                state.next_loop = FIRST_LOOP;
            }
            let dev = PathBuf::from(format!("/dev/loop{}", state.next_loop));
            state.next_loop += 1;
            state.loops.insert(dev.clone(), backing);
            Ok(format!("{}\n", dev.display()))
        } else if has("--detach") {
            let dev = last.ok_or_else(|| anyhow!("losetup: no device"))?;
            if state.loops.remove(&dev).is_none() {
                bail!(
                    "'losetup' failed (exit code 1):\nlosetup: {}: detach failed: No such device or address",
                    dev.display()
                );
            }
            Ok(String::new())
        } else if has("--associated") {
            let pos = args.iter().position(|a| a == "--associated");
            let file = pos
                .and_then(|i| args.get(i + 1))
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("losetup: --associated needs a file"))?;
            Ok(state
                .loops
                .iter()
                .filter(|(_, backing)| **backing == file)
                .map(|(dev, backing)| format!("{}: []: ({})\n", dev.display(), backing.display()))
                .collect())
        } else {
            Ok(String::new())
        }
    }

    fn simulate_qemu_img(&self, args: &[String]) -> Result<String> {
        let mut state = self.state();
        match args.first().map(String::as_str) {
            Some("convert") => {
                let format = args
                    .iter()
                    .position(|a| a == "-O")
                    .and_then(|i| args.get(i + 1))
                    .cloned()
                    .ok_or_else(|| anyhow!("qemu-img convert: missing -O"))?;
                let out = args
                    .last()
                    .map(PathBuf::from)
                    .ok_or_else(|| anyhow!("qemu-img convert: missing output"))?;
                fs::write(&out, format!("{} image\n", format))
                    .with_context(|| format!("qemu-img: cannot write {}", out.display()))?;
                state.converted.insert(out, format);
                Ok(String::new())
            }
            Some("info") => {
                let path = args
                    .last()
                    .map(PathBuf::from)
                    .ok_or_else(|| anyhow!("qemu-img info: missing file"))?;
                let format = state
                    .converted
                    .get(&path)
                    .ok_or_else(|| anyhow!("qemu-img: Could not open '{}'", path.display()))?;
                Ok(serde_json::json!({
                    "filename": path.display().to_string(),
                    "format": format,
                    "virtual-size": 0,
                })
                .to_string())
            }
            _ => Ok(String::new()),
        }
    }

    fn store_dir(state: &mut State, key: &str) -> Result<PathBuf> {
        if state.stores.is_none() {
            state.stores = Some(TempDir::new().context("Failed to create filesystem store")?);
        }
        let root = state
            .stores
            .as_ref()
            .map(|d| d.path().to_path_buf())
            .ok_or_else(|| anyhow!("filesystem store missing"))?;
        let dir = root.join(key);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

impl Host for RecordingHost {
    fn run(&self, cmd: Cmd) -> Result<CommandResult> {
        let line = cmd.to_string();
        let failing = {
            let mut state = self.state();
            state.ops.push(HostOp::Run(line.clone()));
            state.failing_commands.iter().any(|p| line.contains(p.as_str()))
        };

        if failing {
            bail!("{} (exit code 1):\nsimulated failure", cmd.failure_prefix());
        }

        {
            let hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
            for (program, hook) in hooks.iter() {
                if program == cmd.program() {
                    hook(&cmd).with_context(|| format!("'{}' failed", cmd.program()))?;
                }
            }
        }

        let stdout = self.simulate(&cmd)?;
        Ok(CommandResult {
            status: ExitStatus::from_raw(0),
            stdout,
            stderr: String::new(),
        })
    }

    fn mount(&self, entry: &MountEntry) -> Result<()> {
        let mut state = self.state();
        let target = entry.target.clone();
        state.ops.push(HostOp::Mount(target.clone()));

        let target_str = target.to_string_lossy().into_owned();
        if state
            .failing_mounts
            .iter()
            .any(|p| target_str.contains(p.as_str()))
        {
            bail!("mount {}: simulated failure", target.display());
        }
        if !target.is_dir() {
            bail!("mount point {} does not exist", target.display());
        }

        let store = match &entry.source {
            MountSource::Device { path, .. } => {
                let key = store_key(path, entry.options.data.as_deref());
                let dir = Self::store_dir(&mut state, &key)?;
                move_children(&dir, &target)?;
                Some(dir)
            }
            _ => None,
        };
        state.mounted.push(Mounted { target, store });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<Unmounted> {
        let mut state = self.state();
        state.ops.push(HostOp::Unmount(target.to_path_buf()));

        let target_str = target.to_string_lossy().into_owned();
        if state
            .failing_unmounts
            .iter()
            .any(|p| target_str.contains(p.as_str()))
        {
            bail!("umount {}: target is busy (simulated)", target.display());
        }

        let Some(idx) = state.mounted.iter().rposition(|m| m.target == target) else {
            return Ok(Unmounted::NotMounted);
        };
        let mounted = state.mounted.remove(idx);

        // Anything still mounted below forces a lazy detach of the subtree.
        let before = state.mounted.len();
        state
            .mounted
            .retain(|m| !(m.target.starts_with(target) && m.target != target));
        let nested = state.mounted.len() != before;

        match mounted.store {
            Some(store) => move_children(target, &store)?,
            None => remove_children(target)?,
        }

        if nested || state.busy.contains(target) {
            Ok(Unmounted::Lazy)
        } else {
            Ok(Unmounted::Released)
        }
    }

    fn device_ready(&self, path: &Path) -> bool {
        let state = self.state();
        if state.partitions_hidden {
            return false;
        }
        let path = path.to_string_lossy();
        state.loops.keys().any(|dev| {
            path.strip_prefix(&format!("{}p", dev.display()))
                .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false)
        })
    }
}

fn store_key(device: &Path, data: Option<&str>) -> String {
    format!("{}{}", device.display(), data.unwrap_or(""))
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn move_children(from: &Path, to: &Path) -> Result<()> {
    if !from.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        fs::rename(entry.path(), &dest).with_context(|| {
            format!(
                "Failed to move {} to {}",
                entry.path().display(),
                dest.display()
            )
        })?;
    }
    Ok(())
}

fn remove_children(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Lay down the smallest tree the install and inject stages accept: shells,
/// `etc/os-release`, a passwd file, stale machine ids, an editor binary and
/// one unit file per name in `units`.
pub fn populate_minimal_tree(root: &Path, units: &[&str]) -> Result<()> {
    for bin in ["bin/sh", "bin/bash", "usr/bin/nvim"] {
        write_file_mode(root.join(bin), "#!/bin/true\n", 0o755)?;
    }
    write_file_with_dirs(
        root.join("etc/os-release"),
        "PRETTY_NAME=\"Debian GNU/Linux\"\nID=debian\n",
    )?;
    write_file_with_dirs(
        root.join("etc/passwd"),
        "root:x:0:0:root:/root:/bin/sh\n\
         daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n",
    )?;
    write_file_with_dirs(root.join("etc/machine-id"), "0123456789abcdef0123456789abcdef\n")?;
    write_file_with_dirs(
        root.join("var/lib/dbus/machine-id"),
        "0123456789abcdef0123456789abcdef\n",
    )?;
    write_file_with_dirs(root.join("etc/bash.bashrc"), "# System-wide .bashrc\n")?;
    fs::create_dir_all(root.join("usr/share/zoneinfo"))?;

    for unit in units {
        let name = if unit.contains('.') {
            unit.to_string()
        } else {
            format!("{}.service", unit)
        };
        let wanted_by = if name.starts_with("systemd-resolved") {
            "sysinit.target"
        } else {
            "multi-user.target"
        };
        write_file_with_dirs(
            root.join("lib/systemd/system").join(&name),
            format!(
                "[Unit]\nDescription={}\n\n[Service]\nExecStart=/bin/true\n\n[Install]\nWantedBy={}\n",
                name, wanted_by
            ),
        )?;
    }
    Ok(())
}
