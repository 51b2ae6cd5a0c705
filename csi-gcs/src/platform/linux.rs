//! Linux host probes for FUSE mounts.
//!
//! Uses:
//! - /proc/mounts for mount points
//! - /proc/<pid>/cmdline and /proc/<pid>/stat for helper processes
//! - fusermount, falling back to umount, for unmounting

use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::exec::Invocation;
use crate::mounter::{MountError, MountState};

const PROC_MOUNTS: &str = "/proc/mounts";

/// Mode for mount target directories created by the driver.
pub const TARGET_DIR_MODE: u32 = 0o750;

const EXIT_POLL_START: Duration = Duration::from_millis(10);
const EXIT_POLL_MAX: Duration = Duration::from_millis(500);

/// Undo the octal escaping /proc/mounts applies to whitespace and backslashes.
fn decode_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether `target` appears as a mount point in a mounts table.
fn table_contains(table: &str, target: &Path) -> bool {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|field| Path::new(&decode_mount_field(field)) == target)
}

/// Three-state probe with no side effects.
pub fn mount_state(target: &Path) -> io::Result<MountState> {
    match fs::metadata(target) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(MountState::Stale),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(MountState::NotMounted),
        Err(e) => return Err(e),
    }

    let table = fs::read_to_string(PROC_MOUNTS)?;
    Ok(if table_contains(&table, target) {
        MountState::Mounted
    } else {
        MountState::NotMounted
    })
}

/// Mounted or stale. A missing target is created and reported unmounted.
pub fn is_mounted(target: &Path) -> io::Result<bool> {
    if let Err(e) = fs::metadata(target)
        && e.kind() == io::ErrorKind::NotFound
    {
        debug!(target = %target.display(), "Creating missing mount target");
        create_target_dir(target)?;
        return Ok(false);
    }
    Ok(!matches!(mount_state(target)?, MountState::NotMounted))
}

fn create_target_dir(target: &Path) -> io::Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(TARGET_DIR_MODE)
        .create(target)
}

/// Make sure `target` is a directory, creating it when absent.
pub fn ensure_directory(target: &Path) -> Result<(), MountError> {
    match fs::metadata(target) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(MountError::InvalidTarget(format!(
            "{} exists and is not a directory",
            target.display()
        ))),
        // A stale FUSE mount still occupies a directory
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(create_target_dir(target)?),
        Err(e) => Err(e.into()),
    }
}

fn reports_not_mounted(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("not mounted") || stderr.contains("not found in /etc/mtab")
}

/// Unmount a FUSE target, treating "not mounted" as success.
pub async fn unmount(target: &Path) -> Result<(), MountError> {
    info!(target = %target.display(), "Unmounting");

    match Invocation::new("fusermount")
        .args([std::ffi::OsStr::new("-u"), target.as_os_str()])
        .run()
        .await
    {
        Ok(output) if output.success => return Ok(()),
        Ok(output) if reports_not_mounted(&output.stderr) => {
            warn!(target = %target.display(), "Path was not mounted");
            return Ok(());
        }
        Ok(output) => {
            debug!(stderr = %output.stderr, "fusermount failed, falling back to umount");
        }
        Err(e) => {
            debug!(error = %e, "fusermount unavailable, falling back to umount");
        }
    }

    let output = Invocation::new("umount")
        .args([target.as_os_str()])
        .run()
        .await?;
    if output.success {
        return Ok(());
    }
    if reports_not_mounted(&output.stderr) {
        warn!(target = %target.display(), "Path was not mounted");
        return Ok(());
    }
    Err(MountError::UnmountFailed(format!(
        "{}: {}",
        target.display(),
        output.stderr
    )))
}

/// Lazy unmount for stale targets whose helper is already gone.
pub async fn unmount_lazy(target: &Path) -> Result<(), MountError> {
    let output = Invocation::new("umount")
        .args([std::ffi::OsStr::new("-l"), target.as_os_str()])
        .run()
        .await?;
    if output.success || reports_not_mounted(&output.stderr) {
        return Ok(());
    }
    Err(MountError::UnmountFailed(format!(
        "{}: {}",
        target.display(),
        output.stderr
    )))
}

fn cmdline_references(cmdline: &[u8], target: &str) -> bool {
    cmdline
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .any(|arg| arg == target.as_bytes())
}

/// Find a process with `target` among its arguments.
pub fn find_process_by_cmdline(target: &Path) -> Option<u32> {
    let target = target.to_string_lossy();
    let own_pid = std::process::id();

    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "Failed to read /proc");
            return None;
        }
    };

    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| *pid != own_pid)
        .find(|pid| {
            fs::read(format!("/proc/{}/cmdline", pid))
                .map(|cmdline| cmdline_references(&cmdline, &target))
                .unwrap_or(false)
        })
}

/// Process state letter from the contents of /proc/<pid>/stat.
fn stat_state(stat: &str) -> Option<char> {
    // The command name may contain spaces and parentheses
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().next()?.chars().next()
}

fn process_exited(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => matches!(stat_state(&stat), Some('Z') | Some('X')),
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            debug!(pid, "No permission to inspect process, assuming it exited");
            true
        }
        Err(e) => {
            warn!(pid, error = %e, "Failed to inspect process");
            false
        }
    }
}

/// Wait for `pid` to exit or become a zombie, backing off between checks.
pub async fn wait_for_process_exit(
    pid: u32,
    target: &Path,
    timeout: Duration,
) -> Result<(), MountError> {
    let deadline = Instant::now() + timeout;
    let mut delay = EXIT_POLL_START;

    loop {
        if process_exited(pid) {
            debug!(pid, "Mount helper exited");
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(MountError::ProcessLingering {
                pid,
                target: target.display().to_string(),
            });
        }
        tokio::time::sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(EXIT_POLL_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_decode_mount_field() {
        assert_eq!(decode_mount_field("/mnt/a\\040b"), "/mnt/a b");
        assert_eq!(decode_mount_field("/mnt/tab\\011x"), "/mnt/tab\tx");
        assert_eq!(decode_mount_field("/mnt/back\\134slash"), "/mnt/back\\slash");
        assert_eq!(decode_mount_field("/plain"), "/plain");
        assert_eq!(decode_mount_field("/trailing\\04"), "/trailing\\04");
    }

    #[test]
    fn test_table_contains() {
        let table = "\
gcsfuse /var/lib/kubelet/pods/x/volumes/my\\040vol fuse.gcsfuse rw,nosuid 0 0
proc /proc proc rw 0 0
";
        assert!(table_contains(
            table,
            Path::new("/var/lib/kubelet/pods/x/volumes/my vol")
        ));
        assert!(table_contains(table, Path::new("/proc")));
        assert!(!table_contains(table, Path::new("/var/lib/kubelet")));
    }

    #[test]
    fn test_mount_state_of_plain_dir() {
        let dir = TempDir::new().unwrap();
        assert_eq!(mount_state(dir.path()).unwrap(), MountState::NotMounted);
        assert_eq!(
            mount_state(&dir.path().join("missing")).unwrap(),
            MountState::NotMounted
        );
        assert_eq!(mount_state(Path::new("/proc")).unwrap(), MountState::Mounted);
    }

    #[test]
    fn test_is_mounted_creates_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("pods/vol");

        assert!(!is_mounted(&target).unwrap());
        let meta = fs::metadata(&target).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, TARGET_DIR_MODE);
        assert!(!is_mounted(&target).unwrap());
    }

    #[test]
    fn test_ensure_directory_rejects_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, "x").unwrap();

        assert!(matches!(
            ensure_directory(&file),
            Err(MountError::InvalidTarget(_))
        ));
        ensure_directory(&dir.path().join("new")).unwrap();
        assert!(dir.path().join("new").is_dir());
    }

    #[test]
    fn test_stat_state() {
        assert_eq!(stat_state("42 (gcs fuse) S 1 42 42"), Some('S'));
        assert_eq!(stat_state("42 (a) b) Z 1"), Some('Z'));
        assert_eq!(stat_state("garbage"), None);
    }

    #[test]
    fn test_cmdline_references() {
        let cmdline = b"gcsfuse\0--foreground\0bucket\0/mnt/target\0";
        assert!(cmdline_references(cmdline, "/mnt/target"));
        assert!(!cmdline_references(cmdline, "/mnt/targe"));
    }

    #[test]
    fn test_reports_not_mounted() {
        assert!(reports_not_mounted("umount: /mnt/x: not mounted."));
        assert!(reports_not_mounted(
            "fusermount: entry for /mnt/x not found in /etc/mtab"
        ));
        assert!(!reports_not_mounted("umount: /mnt/x: target is busy."));
    }

    #[tokio::test]
    async fn test_find_and_wait_for_process() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("target");

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 5; :")
            .arg(&marker)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        assert_eq!(find_process_by_cmdline(&marker), Some(pid));

        let err = wait_for_process_exit(pid, &marker, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, MountError::ProcessLingering { .. }));

        child.start_kill().unwrap();
        wait_for_process_exit(pid, &marker, Duration::from_secs(2))
            .await
            .unwrap();
        let _ = child.wait().await;
    }
}
