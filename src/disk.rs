//! Full disk build through the host's block device tools
//!
//! Loop devices and mounts are held by guards that release them on drop,
//! on the error path as much as on success.

use std::fs::{self, File};
use std::mem::ManuallyDrop;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use xshell::{cmd, Shell};

use crate::pipeline::{AssembleJob, LayoutKind};

pub const DEFAULT_DISK_SIZE_MIB: u64 = 32;

/// Start of the ext2 partition; everything in front belongs to the
/// boot sector and kernel.
pub const PARTITION_START: &str = "1MiB";

/// Everything the full disk build reads and writes.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    pub output: PathBuf,
    pub size_mib: u64,
    pub boot: PathBuf,
    pub boot_elf: PathBuf,
    pub kernel: Vec<PathBuf>,
    pub layout: LayoutKind,
    /// Copied into the root of the ext2 partition
    pub user_files: Vec<PathBuf>,
}

impl DiskConfig {
    /// Defaults for a build directory laid out by the OS makefile.
    pub fn from_build_dir(build_dir: &Path) -> Self {
        DiskConfig {
            output: build_dir.join("diskimg"),
            size_mib: DEFAULT_DISK_SIZE_MIB,
            boot: build_dir.join("boot.bin"),
            boot_elf: build_dir.join("boot.elf"),
            kernel: vec![build_dir.join("kernel.bin")],
            layout: LayoutKind::Direct,
            user_files: vec![build_dir.join("shell.bin")],
        }
    }
}

/// Attached loop device, detached on drop.
pub struct LoopDevice<'a> {
    sh: &'a Shell,
    device: String,
}

impl<'a> LoopDevice<'a> {
    pub fn attach(sh: &'a Shell, image: &Path) -> Result<Self> {
        let device = cmd!(sh, "losetup --find --partscan --show {image}")
            .read()
            .with_context(|| format!("failed to attach {} to a loop device", image.display()))?;
        log::info!("attached {} as {}", image.display(), device);
        Ok(LoopDevice { sh, device })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn partition(&self, index: u32) -> String {
        partition_device(&self.device, index)
    }

    /// Leaves the device attached and hands back its path.
    pub fn keep(self) -> String {
        let this = ManuallyDrop::new(self);
        this.device.clone()
    }

    /// Detaches now and reports failure, unlike the drop path.
    pub fn detach(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        let device = &this.device;
        cmd!(this.sh, "losetup -d {device}")
            .run()
            .with_context(|| format!("failed to detach {device}"))?;
        log::debug!("detached {}", device);
        Ok(())
    }
}

impl Drop for LoopDevice<'_> {
    fn drop(&mut self) {
        let device = &self.device;
        match cmd!(self.sh, "losetup -d {device}").run() {
            Ok(()) => log::debug!("detached {}", device),
            Err(err) => log::error!("failed to detach {}: {}", device, err),
        }
    }
}

/// Mounted filesystem, unmounted on drop.
pub struct Mount<'a> {
    sh: &'a Shell,
    target: PathBuf,
}

impl<'a> Mount<'a> {
    pub fn new(sh: &'a Shell, source: &str, target: &Path) -> Result<Self> {
        cmd!(sh, "mount {source} {target}")
            .run()
            .with_context(|| format!("failed to mount {} on {}", source, target.display()))?;
        log::debug!("mounted {} on {}", source, target.display());
        Ok(Mount {
            sh,
            target: target.to_path_buf(),
        })
    }

    pub fn keep(self) -> PathBuf {
        let this = ManuallyDrop::new(self);
        this.target.clone()
    }

    /// Unmounts now and reports failure, unlike the drop path.
    pub fn unmount(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        let target = &this.target;
        cmd!(this.sh, "umount {target}")
            .run()
            .with_context(|| format!("failed to unmount {}", target.display()))?;
        log::debug!("unmounted {}", target.display());
        Ok(())
    }
}

impl Drop for Mount<'_> {
    fn drop(&mut self) {
        let target = &self.target;
        match cmd!(self.sh, "umount {target}").run() {
            Ok(()) => log::debug!("unmounted {}", target.display()),
            Err(err) => log::error!("failed to unmount {}: {}", target.display(), err),
        }
    }
}

/// Empty directory to mount on, removed on drop.
///
/// Removal is `remove_dir`, which refuses a non-empty directory, so a
/// mount that failed to go away keeps its files.
pub struct MountPoint {
    path: PathBuf,
}

impl MountPoint {
    pub fn create(path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(MountPoint { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keep(self) -> PathBuf {
        let this = ManuallyDrop::new(self);
        this.path.clone()
    }
}

impl Drop for MountPoint {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir(&self.path) {
            log::warn!("left {} behind: {}", self.path.display(), err);
        }
    }
}

/// Scratch mount point for this process
fn mount_point_path() -> PathBuf {
    std::env::temp_dir().join(format!("naos-{}", std::process::id()))
}

/// Image length for `size_mib`, refusing sizes that do not fit a u64.
pub fn image_size_bytes(size_mib: u64) -> Result<u64> {
    size_mib
        .checked_mul(1024 * 1024)
        .with_context(|| format!("disk size of {size_mib} MiB is too large"))
}

/// Partition node the kernel creates for a `--partscan` loop device.
pub fn partition_device(device: &str, index: u32) -> String {
    format!("{device}p{index}")
}

/// Builds a partitioned, bootable disk image from scratch.
pub fn build_disk(config: &DiskConfig) -> Result<()> {
    let sh = Shell::new()?;

    // 1. Zeroed image of the requested size
    let size = image_size_bytes(config.size_mib)?;
    File::create(&config.output)
        .and_then(|file| file.set_len(size))
        .with_context(|| format!("failed to create {}", config.output.display()))?;
    hand_back_to_sudo_user(&config.output)?;
    log::info!("created {} ({} MiB)", config.output.display(), config.size_mib);

    // 2. One bootable ext2 partition behind the boot region
    let loop_dev = LoopDevice::attach(&sh, &config.output)?;
    let device = loop_dev.device();
    cmd!(
        sh,
        "parted -s {device} mklabel msdos mkpart primary ext2 {PARTITION_START} 100% -a minimal set 1 boot on"
    )
    .run()
    .context("failed to partition the disk image")?;
    let partition = loop_dev.partition(1);
    cmd!(sh, "mke2fs -q {partition}")
        .run()
        .context("failed to create the ext2 filesystem")?;

    // 3. Boot sector and kernel, keeping the table parted just wrote
    let job = AssembleJob {
        boot: config.boot.clone(),
        symbols: Some(config.boot_elf.clone()),
        kernel: config.kernel.clone(),
        layout: config.layout,
        partition_table_from: Some(PathBuf::from(device)),
        output: PathBuf::from(device),
    };
    job.run()?;

    // 4. User files
    let mount_point = MountPoint::create(mount_point_path())?;
    let mount = Mount::new(&sh, &partition, mount_point.path())?;
    for file in &config.user_files {
        let name = file
            .file_name()
            .with_context(|| format!("{} has no file name", file.display()))?;
        fs::copy(file, mount_point.path().join(name))
            .with_context(|| format!("failed to copy {}", file.display()))?;
        log::info!("copied {}", file.display());
    }

    // 5. Release in order; the mount point only goes once it is empty again
    mount.unmount()?;
    drop(mount_point);
    loop_dev.detach()
}

/// Attaches and mounts the first partition of `image` and leaves it so.
///
/// Returns the loop device and mount point for the caller to clean up.
pub fn mount_disk(image: &Path) -> Result<(String, PathBuf)> {
    let sh = Shell::new()?;
    let loop_dev = LoopDevice::attach(&sh, image)?;

    let mount_point = MountPoint::create(mount_point_path())?;
    let mount = Mount::new(&sh, &loop_dev.partition(1), mount_point.path())?;

    mount_point.keep();
    Ok((loop_dev.keep(), mount.keep()))
}

/// The build runs under sudo; give the image back to whoever called it.
#[cfg(unix)]
fn hand_back_to_sudo_user(path: &Path) -> Result<()> {
    let (Ok(uid), Ok(gid)) = (std::env::var("SUDO_UID"), std::env::var("SUDO_GID")) else {
        return Ok(());
    };
    let uid: u32 = uid.parse().context("SUDO_UID is not a number")?;
    let gid: u32 = gid.parse().context("SUDO_GID is not a number")?;
    std::os::unix::fs::chown(path, Some(uid), Some(gid))
        .with_context(|| format!("failed to chown {}", path.display()))
}

#[cfg(not(unix))]
fn hand_back_to_sudo_user(_path: &Path) -> Result<()> {
    Ok(())
}
