//! Mount-point lifecycle helpers used both at startup (speculative detach
//! of a stale prior mount) and by [`crate::store::StoreClient`]'s retry
//! loop once the document store is unreachable past its configured
//! budget. See spec §4.1 and §6.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Detach `mountpoint` from the kernel bridge, ignoring failure. Run
/// before mounting (in case a previous process crashed without
/// unmounting) and again as the first step of [`abort`].
pub fn detach(mountpoint: &Path) {
    let status = Command::new("fusermount").arg("-u").arg(mountpoint).status();
    if let Err(e) = status {
        log::debug!("speculative detach of {} failed to spawn: {e}", mountpoint.display());
    }
}

/// The mount-abort routine: detach, wait briefly for the kernel to settle
/// the unmount, then self-terminate with `SIGTERM` so an external
/// supervisor can restart the process against a healthy store.
pub fn abort(mountpoint: &Path) -> ! {
    log::error!(
        "store unreachable past the configured access-attempt budget; aborting mount at {}",
        mountpoint.display()
    );
    detach(mountpoint);
    std::thread::sleep(Duration::from_millis(500));
    let _ = kill(Pid::this(), Signal::SIGTERM);
    std::process::exit(1);
}
