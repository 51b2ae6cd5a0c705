//! Host operations for the node service.
//!
//! Linux only: mount-table and process-table probes plus the unmount
//! tools the FUSE helper relies on.

mod linux;

pub use linux::{
    TARGET_DIR_MODE, ensure_directory, find_process_by_cmdline, is_mounted, mount_state, unmount,
    unmount_lazy, wait_for_process_exit,
};
