//! Socket path helpers.
//!
//! `sun_path` is 108 bytes on Linux and 104 on macOS and the BSDs, including
//! the trailing NUL. Paths that do not fit are rejected up front with a
//! readable error instead of a truncated bind.

use std::io;
use std::path::{Path, PathBuf};

/// Default socket filename.
pub const DEFAULT_SOCKET_NAME: &str = "localsock.sock";

/// Size of `sockaddr_un.sun_path` on this platform.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const MAX_SOCKET_PATH: usize = 108;

/// Size of `sockaddr_un.sun_path` on this platform.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const MAX_SOCKET_PATH: usize = 104;

/// Get the default socket path.
///
/// Priority:
/// 1. `$XDG_RUNTIME_DIR/localsock.sock` (via `dirs::runtime_dir`)
/// 2. `<temp dir>/localsock.sock` as fallback
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DEFAULT_SOCKET_NAME)
}

/// Check that `path` fits in `sun_path`.
///
/// # Errors
///
/// Returns an `InvalidInput` error naming the limit if the path is empty or
/// too long.
pub fn validate_socket_path(path: &Path) -> io::Result<()> {
    let len = path.as_os_str().len();
    if len == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket path is empty"));
    }
    if len >= MAX_SOCKET_PATH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "socket path too long ({len} bytes, max {}): {}",
                MAX_SOCKET_PATH - 1,
                path.display()
            ),
        ));
    }
    Ok(())
}
