use core::fmt;

use errno::Errno;

#[derive(Debug)]
pub enum Error {
    /// A registered, running thread could not be signalled to suspend. The
    /// world was resumed before this error was returned.
    Suspend {
        thread: Option<String>,
        errno: Errno,
    },
    /// The OS refused to create a thread.
    Spawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Suspend { thread, errno } => write!(
                f,
                "failed to suspend thread {}: {}",
                thread.as_deref().unwrap_or("<unnamed>"),
                errno
            ),
            Error::Spawn(err) => write!(f, "failed to spawn thread: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Suspend { errno, .. } => Some(errno),
            Error::Spawn(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Spawn(err)
    }
}
