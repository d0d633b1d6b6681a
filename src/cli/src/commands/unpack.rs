//! `a3s-rootfs unpack` - child side of the layer unpack protocol.
//!
//! Started by the store with the control pipe on fd 3 and the layer's tar
//! stream on stdin. Exits 0 after extracting, 0 without touching the target
//! when the parent aborts, and 1 with a diagnostic on stderr otherwise.

use std::fs::File;
use std::os::fd::FromRawFd;
use std::path::PathBuf;

use a3s_rootfs_runtime::{run_unpack_child, ChildOutcome, TarExtractor, CONTROL_FD};
use clap::Args;
use nix::fcntl::{fcntl, FcntlArg};

#[derive(Args)]
pub struct UnpackArgs {
    /// Directory to extract into
    pub target: PathBuf,

    /// tar binary used for extraction
    #[arg(long, default_value = "tar")]
    pub tar: PathBuf,
}

/// Run the child protocol and return the process exit code.
pub fn execute(args: &UnpackArgs) -> i32 {
    if let Err(e) = fcntl(CONTROL_FD, FcntlArg::F_GETFD) {
        eprintln!("control descriptor {CONTROL_FD} is not open: {e}");
        return 1;
    }

    // SAFETY: fd 3 is open (checked above) and was handed to this process
    // for its exclusive use by the parent.
    let mut control = unsafe { File::from_raw_fd(CONTROL_FD) };
    let extractor = TarExtractor::new(args.tar.clone());
    let mut layer = std::io::stdin().lock();

    match run_unpack_child(&mut control, &mut layer, &args.target, &extractor) {
        Ok(ChildOutcome::Extracted) => 0,
        Ok(ChildOutcome::Aborted) => {
            tracing::debug!(target = %args.target.display(), "Unpack aborted by parent");
            0
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}
