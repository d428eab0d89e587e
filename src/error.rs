use std::{io, net::SocketAddr, path::PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("could not locate the running executable")]
    CurrentExe(#[source] io::Error),
    #[error("executable path {} has no parent directory", .0.display())]
    NoLaunchDir(PathBuf),
    #[error("could not change into {}", .dir.display())]
    ChangeDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}
