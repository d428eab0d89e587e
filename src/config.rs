use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

use crate::error::ServeError;

pub const PORT: u16 = 8000;

/// Everything the server needs to know, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Absolute directory that request paths are resolved against.
    pub root: PathBuf,
}

impl ServerConfig {
    pub fn new(addr: SocketAddr, root: PathBuf) -> Self {
        Self { addr, root }
    }

    /// Listen on all interfaces on [`PORT`] and serve the directory the binary lives in.
    pub fn from_launch_dir() -> Result<Self, ServeError> {
        let root = launch_dir()?;
        Ok(Self::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, PORT)), root))
    }
}

/// Makes `root` the process working directory, so relative lookups resolve against the site.
pub fn enter_root(root: &Path) -> Result<(), ServeError> {
    std::env::set_current_dir(root).map_err(|source| ServeError::ChangeDir {
        dir: root.to_path_buf(),
        source,
    })
}

/// The canonical directory containing the running executable.
///
/// Independent of the shell's working directory, so the site is found no matter
/// where the server was started from.
pub fn launch_dir() -> Result<PathBuf, ServeError> {
    let exe = std::env::current_exe()
        .and_then(|exe| exe.canonicalize())
        .map_err(ServeError::CurrentExe)?;
    match exe.parent() {
        Some(dir) => Ok(dir.to_path_buf()),
        None => Err(ServeError::NoLaunchDir(exe)),
    }
}
