//! Per-OS device access backends
//!
//! Each backend fills the same capability table; the one matching the
//! build target is returned by [`current`]. Unmount and volume locking are
//! best effort: failure there never prevents opening the device.

use std::fs::File;
use std::io;
use std::path::Path;

/// Capability table for one operating system
pub struct Platform {
    /// Backend name for diagnostics
    pub name: &'static str,
    /// Detach any filesystem view of the disk before raw access
    pub release_mounts: fn(&Path),
    /// Open the device for exclusive read/write access
    pub open: fn(&Path) -> io::Result<File>,
    /// Lock the volume after opening
    pub lock: fn(&File),
    /// Unlock the volume before closing
    pub unlock: fn(&File),
}

/// Backend for the running platform
pub fn current() -> &'static Platform {
    &CURRENT
}

#[cfg(target_os = "linux")]
static CURRENT: Platform = Platform {
    name: "linux",
    release_mounts: linux::unmount_partitions,
    open: linux::open,
    lock: nop_lock,
    unlock: nop_lock,
};

#[cfg(target_os = "macos")]
static CURRENT: Platform = Platform {
    name: "macos",
    release_mounts: macos::unmount_disk,
    open: unix::open,
    lock: nop_lock,
    unlock: nop_lock,
};

#[cfg(all(unix, not(any(target_os = "linux", target_os = "macos"))))]
static CURRENT: Platform = Platform {
    name: "unix",
    release_mounts: nop_release,
    open: unix::open,
    lock: nop_lock,
    unlock: nop_lock,
};

#[cfg(windows)]
static CURRENT: Platform = Platform {
    name: "windows",
    release_mounts: nop_release,
    open: windows::open,
    lock: windows::lock_volume,
    unlock: windows::unlock_volume,
};

#[allow(dead_code)]
fn nop_release(_path: &Path) {}

#[allow(dead_code)]
fn nop_lock(_file: &File) {}

#[cfg(unix)]
mod unix {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::unix::fs::OpenOptionsExt;
    use std::path::Path;

    pub fn open_with(path: &Path, flags: i32) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC | flags)
            .open(path)
    }

    #[allow(dead_code)]
    pub fn open(path: &Path) -> io::Result<File> {
        open_with(path, 0)
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::{self, File};
    use std::io;
    use std::path::Path;
    use std::process::{Command, Stdio};

    /// O_EXCL on a block device fails with EBUSY while it is mounted
    pub fn open(path: &Path) -> io::Result<File> {
        super::unix::open_with(path, libc::O_EXCL)
    }

    /// A mounted filesystem on the disk or one of its partitions
    #[derive(Debug, PartialEq, Eq)]
    pub struct Mount {
        pub source: String,
        pub target: String,
    }

    /// `/proc/mounts` entries backed by `disk` (`/dev/sdb`, `/dev/sdb1`,
    /// `/dev/mmcblk0p1`), most recent first
    pub fn mounts_of(table: &str, disk: &Path) -> Vec<Mount> {
        let disk = disk.to_string_lossy();
        let mut found: Vec<Mount> = table
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let source = fields.next()?;
                let target = fields.next()?;
                let rest = source.strip_prefix(&*disk)?;
                let rest = rest.strip_prefix('p').unwrap_or(rest);
                if !rest.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                Some(Mount {
                    source: source.to_string(),
                    target: unescape(target),
                })
            })
            .collect();
        found.reverse();
        found
    }

    /// Undo the octal escapes the kernel applies to mount paths
    fn unescape(field: &str) -> String {
        let bytes = field.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            let octal = bytes.get(i + 1..i + 4).filter(|d| {
                bytes[i] == b'\\' && d.iter().all(|c| (b'0'..=b'7').contains(c))
            });
            match octal {
                Some(d) => {
                    out.push(d.iter().fold(0u8, |v, c| (v << 3) | (c - b'0')));
                    i += 4;
                }
                None => {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    fn run(program: &str, args: &[&str]) -> bool {
        let status = Command::new(program)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => true,
            Ok(s) => {
                log::debug!("{} {}: {}", program, args.join(" "), s);
                false
            }
            Err(e) => {
                log::debug!("{} unavailable: {}", program, e);
                false
            }
        }
    }

    /// Unmount every filesystem on the disk so the exclusive open succeeds
    pub fn unmount_partitions(disk: &Path) {
        let table = match fs::read_to_string("/proc/mounts") {
            Ok(table) => table,
            Err(e) => {
                log::debug!("/proc/mounts unreadable: {}", e);
                return;
            }
        };
        for mount in mounts_of(&table, disk) {
            let released = run("udisksctl", &["unmount", "--no-user-interaction", "-b", &mount.source])
                || run("umount", &[&mount.target]);
            if released {
                log::debug!("unmounted {} from {}", mount.source, mount.target);
            } else {
                log::warn!("{} is still mounted at {}", mount.source, mount.target);
            }
        }
    }

}

#[cfg(target_os = "macos")]
mod macos {
    use std::path::Path;
    use std::process::{Command, Stdio};

    pub fn unmount_disk(path: &Path) {
        let status = Command::new("diskutil")
            .args(["unmountDisk", "force"])
            .arg(path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => log::debug!("unmounted {}", path.display()),
            Ok(s) => log::debug!("diskutil unmountDisk {}: {}", path.display(), s),
            Err(e) => log::debug!("diskutil unavailable: {}", e),
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::windows::fs::OpenOptionsExt;
    use std::os::windows::io::AsRawHandle;
    use std::path::Path;
    use std::ptr;

    use winapi::shared::minwindef::DWORD;
    use winapi::um::ioapiset::DeviceIoControl;
    use winapi::um::winioctl::{FSCTL_LOCK_VOLUME, FSCTL_UNLOCK_VOLUME};
    use winapi::um::winnt::{FILE_SHARE_READ, FILE_SHARE_WRITE, HANDLE};

    pub fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
            .open(path)
    }

    fn control(file: &File, code: DWORD) -> bool {
        let mut returned: DWORD = 0;
        // SAFETY: the handle is owned by `file` and stays valid for the call;
        // both control codes take no input or output buffers.
        unsafe {
            DeviceIoControl(
                file.as_raw_handle() as HANDLE,
                code,
                ptr::null_mut(),
                0,
                ptr::null_mut(),
                0,
                &mut returned,
                ptr::null_mut(),
            ) != 0
        }
    }

    pub fn lock_volume(file: &File) {
        if !control(file, FSCTL_LOCK_VOLUME) {
            log::debug!("FSCTL_LOCK_VOLUME failed (already locked?)");
        }
    }

    pub fn unlock_volume(file: &File) {
        if !control(file, FSCTL_UNLOCK_VOLUME) {
            log::debug!("FSCTL_UNLOCK_VOLUME failed");
        }
    }
}

/// Positioned read that does not move the file cursor
#[cfg(unix)]
pub fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

/// Positioned write that does not move the file cursor
#[cfg(unix)]
pub fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

/// Positioned read (moves the cursor on Windows)
#[cfg(windows)]
pub fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// Positioned write (moves the cursor on Windows)
#[cfg(windows)]
pub fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}
