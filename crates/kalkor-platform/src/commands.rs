#[cfg(windows)]
use std::os::windows::process::CommandExt;

#[cfg(windows)]
const DETACHED_PROCESS: u32 = 0x0000_0008;
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Spawn options for a child that must outlive its parent.
pub trait Detach {
    fn detach(&mut self) -> &mut Self;
}

impl Detach for std::process::Command {
    #[cfg(windows)]
    fn detach(&mut self) -> &mut Self {
        self.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW)
    }

    #[cfg(unix)]
    fn detach(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt as _;

        self.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .process_group(0)
    }

    #[cfg(not(any(windows, unix)))]
    fn detach(&mut self) -> &mut Self {
        self.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
    }
}
