//! Single-use cross-process gate over an anonymous pipe.
//!
//! The parent holds the write end, the child the read end. One byte written
//! releases the child; closing the write end without writing makes the
//! child's read return EOF, which it treats as "abort".

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::OwnedFd;

use a3s_rootfs_core::error::{Result, RootfsError};
use nix::fcntl::OFlag;

/// Byte written to release the child.
pub const PROCEED_BYTE: u8 = b'1';

/// What the child observed on its end of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateSignal {
    Proceed,
    Aborted,
}

/// A freshly created control pipe. Both ends are close-on-exec.
#[derive(Debug)]
pub struct ControlPipe {
    reader: OwnedFd,
    writer: OwnedFd,
}

impl ControlPipe {
    pub fn new() -> Result<Self> {
        let (reader, writer) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| RootfsError::UnpackError(format!("Failed to create control pipe: {}", e)))?;
        Ok(Self { reader, writer })
    }

    /// Split into the child's read end and the parent's [`Gate`].
    pub fn into_parts(self) -> (OwnedFd, Gate) {
        (
            self.reader,
            Gate {
                writer: Some(File::from(self.writer)),
            },
        )
    }
}

/// Parent's end of the control pipe. Dropping it unopened aborts the child.
#[derive(Debug)]
pub struct Gate {
    writer: Option<File>,
}

impl Gate {
    /// Release the child and close the pipe.
    pub fn open(mut self) -> Result<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| RootfsError::UnpackError("Control pipe already used".to_string()))?;
        writer.write_all(&[PROCEED_BYTE]).map_err(|e| {
            RootfsError::UnpackError(format!("Failed to signal unpack child: {}", e))
        })
    }

    /// Close the pipe without releasing the child.
    pub fn abort(mut self) {
        self.writer.take();
    }
}

/// Block until the parent opens or abandons the gate.
pub fn wait_for_gate<R: Read + ?Sized>(reader: &mut R) -> std::io::Result<GateSignal> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(GateSignal::Aborted),
            Ok(_) => return Ok(GateSignal::Proceed),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
