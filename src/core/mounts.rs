//! Mount table parsing and classification.
//!
//! Reads the OS mount table once at startup and answers questions the
//! scanner needs at mount boundaries: which device a path lives on, and
//! whether a mount is a real filesystem or a bind/duplicate/system mount.
//! Constructed explicitly in `main` and threaded through the app context;
//! there is no global instance.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Command;

use regex::Regex;
use tracing::{debug, info, warn};

const LSBLK_COMMANDS: &[&str] = &["/bin/lsblk", "/usr/bin/lsblk"];

// ───────────────────────────────────────── mount point ───────

/// One mount table entry.
#[derive(Debug, Clone)]
pub struct MountPoint {
    device: String,
    path: String,
    fs_type: String,
    mount_options: Vec<String>,
    is_duplicate: bool,
}

impl MountPoint {
    pub fn new(device: &str, path: &str, fs_type: &str, mount_options: &str) -> Self {
        Self {
            device: device.to_string(),
            path: path.to_string(),
            fs_type: fs_type.to_string(),
            mount_options: mount_options.split(',').map(str::to_string).collect(),
            is_duplicate: false,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn fs_type(&self) -> &str {
        &self.fs_type
    }

    pub fn mount_options_str(&self) -> String {
        self.mount_options.join(",")
    }

    pub fn is_read_only(&self) -> bool {
        self.mount_options.iter().any(|o| o == "ro")
    }

    pub fn is_btrfs(&self) -> bool {
        self.fs_type.eq_ignore_ascii_case("btrfs")
    }

    pub fn is_ntfs(&self) -> bool {
        self.fs_type.to_lowercase().starts_with("ntfs")
    }

    pub fn is_network_mount(&self) -> bool {
        let fs_type = self.fs_type.to_lowercase();
        fs_type.starts_with("nfs") || fs_type.starts_with("cifs")
    }

    pub fn is_autofs(&self) -> bool {
        self.fs_type.eq_ignore_ascii_case("autofs")
    }

    /// System mounts: kernel-table pseudo devices ("tmpfs", "proc", "cgroup")
    /// never contain a slash in the device name; anything mounted under
    /// /dev, /proc or /sys counts as well.
    pub fn is_system_mount(&self) -> bool {
        if !self.device.contains('/') {
            return true;
        }

        self.path.starts_with("/dev") || self.path.starts_with("/proc") || self.path.starts_with("/sys")
    }

    pub fn is_snap_package(&self) -> bool {
        self.path.starts_with("/snap") && self.fs_type.eq_ignore_ascii_case("squashfs")
    }

    /// A second mount of a device that is already mounted elsewhere
    /// (bind mounts, btrfs subvolumes mounted twice).
    pub fn is_duplicate(&self) -> bool {
        self.is_duplicate
    }

    fn set_duplicate(&mut self) {
        self.is_duplicate = true;
    }
}

// ───────────────────────────────────────── mount table ───────

/// All mount points of the running system, keyed by mount path.
#[derive(Debug, Default)]
pub struct MountTable {
    mount_points: Vec<MountPoint>,
    by_path: HashMap<String, usize>,
    ntfs_devices: HashSet<String>,
}

impl MountTable {
    /// Read `/proc/mounts`, falling back to `/etc/mtab`. An unreadable
    /// mount table yields an empty table (mount-boundary checks degrade
    /// to plain device-id comparison).
    pub fn read() -> Self {
        let ntfs_devices = find_ntfs_devices();

        for file in ["/proc/mounts", "/etc/mtab"] {
            match std::fs::read_to_string(file) {
                Ok(text) => {
                    let table = Self::parse(&text, ntfs_devices.clone());
                    if !table.mount_points.is_empty() {
                        debug!("Read {} mount points from {file}", table.mount_points.len());
                        return table;
                    }
                    warn!("Not a single mount point in {file}");
                }
                Err(err) => warn!("Can't open {file}: {err}"),
            }
        }

        warn!("Could not read either /proc/mounts or /etc/mtab");
        Self::default()
    }

    /// Parse mount table text: `device path fstype options dump fsck`,
    /// whitespace separated, `\040` escaping embedded spaces in paths.
    pub fn parse(text: &str, ntfs_devices: HashSet<String>) -> Self {
        let mut table = Self {
            mount_points: Vec::new(),
            by_path: HashMap::new(),
            ntfs_devices,
        };

        for (line_no, line) in text.lines().enumerate() {
            let fields: Vec<&str> = line.split_whitespace().collect();

            if fields.is_empty() {
                continue;
            }
            if fields.len() < 4 {
                warn!("Bad mount table line {}: {line}", line_no + 1);
                continue;
            }

            let device = fields[0].to_string();
            let path = fields[1].replace("\\040", " ");
            let mut fs_type = fields[2].to_string();
            let mount_opts = fields[3];

            if fs_type == "fuseblk" && table.ntfs_devices.contains(&device) {
                fs_type = "ntfs".to_string();
            }

            let mut mount_point = MountPoint::new(&device, &path, &fs_type, mount_opts);

            if !mount_point.is_system_mount() && table.is_device_mounted(&device) {
                mount_point.set_duplicate();
                info!(
                    "Found duplicate mount of {} at {}",
                    mount_point.device(),
                    mount_point.path()
                );
            }

            table.add(mount_point);
        }

        table
    }

    fn add(&mut self, mount_point: MountPoint) {
        self.by_path
            .insert(mount_point.path.clone(), self.mount_points.len());
        self.mount_points.push(mount_point);
    }

    pub fn is_empty(&self) -> bool {
        self.mount_points.is_empty()
    }

    /// Exact lookup by mount path.
    pub fn find_by_path(&self, path: &str) -> Option<&MountPoint> {
        self.by_path.get(path).map(|&i| &self.mount_points[i])
    }

    /// The mount point governing `start_path`: try the path itself, then
    /// trim one component at a time until a mount path matches.
    pub fn find_nearest(&self, start_path: &str) -> Option<&MountPoint> {
        if let Some(found) = self.find_by_path(start_path) {
            return Some(found);
        }

        let mut components: Vec<&str> = start_path.split('/').filter(|c| !c.is_empty()).collect();

        while !components.is_empty() {
            components.pop();
            let path = format!("/{}", components.join("/"));

            if let Some(found) = self.find_by_path(&path) {
                return Some(found);
            }
        }

        None
    }

    pub fn is_device_mounted(&self, device: &str) -> bool {
        self.mount_points.iter().any(|m| m.device == device)
    }

    pub fn has_btrfs(&self) -> bool {
        self.mount_points.iter().any(MountPoint::is_btrfs)
    }

    /// Mount points a user would consider real filesystems: no system
    /// mounts, duplicates, unmounted autofs stubs or snap packages.
    pub fn normal_mount_points(&self) -> Vec<&MountPoint> {
        self.mount_points
            .iter()
            .filter(|m| {
                !m.is_system_mount() && !m.is_duplicate() && !m.is_autofs() && !m.is_snap_package()
            })
            .collect()
    }

    pub fn all(&self) -> &[MountPoint] {
        &self.mount_points
    }
}

// ───────────────────────────────────────── ntfs detection ────

/// Devices carrying NTFS, detected via lsblk. Such devices show up as
/// "fuseblk" in the mount table (ntfs-3g) and are re-typed to "ntfs".
fn find_ntfs_devices() -> HashSet<String> {
    let Some(lsblk) = LSBLK_COMMANDS.iter().find(|c| Path::new(c).exists()) else {
        info!("No lsblk command available");
        return HashSet::new();
    };

    let output = Command::new(lsblk)
        .args(["--list", "--noheading", "--output", "name,fstype"])
        .output();

    let output = match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).into_owned(),
        Ok(out) => {
            warn!("lsblk failed with {}", out.status);
            return HashSet::new();
        }
        Err(err) => {
            warn!("Can't run lsblk: {err}");
            return HashSet::new();
        }
    };

    parse_ntfs_devices(&output)
}

fn parse_ntfs_devices(lsblk_output: &str) -> HashSet<String> {
    let ntfs_line = Regex::new(r"(?i)\s+ntfs").expect("static regex");
    let mut devices = HashSet::new();

    for line in lsblk_output.lines().filter(|l| ntfs_line.is_match(l)) {
        if let Some(name) = line.split_whitespace().next() {
            let device = format!("/dev/{name}");
            debug!("NTFS on {device}");
            devices.insert(device);
        }
    }

    devices
}
