//! Control socket and credential path resolution.
//!
//! Priority for the socket directory:
//! 1. `TERTERCHAT_SOCKET_DIR` (explicit override)
//! 2. `XDG_RUNTIME_DIR/terterchat` (Linux standard)
//! 3. `~/.terterchat` (home directory fallback)
//! 4. `/tmp/terterchat` (last resort)
//!
//! Credentials live in `TERTERCHAT_CERT_DIR`, or `./certificates` relative to
//! the working directory the daemon was started from.

use std::env;
use std::path::PathBuf;

/// File name of the control socket inside the socket directory.
pub const SOCKET_FILE_NAME: &str = "daemon.sock";

/// Trusted root used to validate the server certificate.
pub const CA_FILE_NAME: &str = "ca.crt";

/// Client certificate presented during the handshake.
pub const CERT_FILE_NAME: &str = "client.crt";

/// Private key matching the client certificate.
pub const KEY_FILE_NAME: &str = "client.key";

/// Get socket directory with priority fallback.
///
/// Empty environment values are ignored.
pub fn get_socket_dir() -> PathBuf {
    if let Ok(dir) = env::var("TERTERCHAT_SOCKET_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join("terterchat");
        }
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".terterchat");
    }

    env::temp_dir().join("terterchat")
}

/// Path of the daemon's control socket.
pub fn get_socket_path() -> PathBuf {
    get_socket_dir().join(SOCKET_FILE_NAME)
}

/// Directory holding the CA, client certificate and client key.
pub fn get_cert_dir() -> PathBuf {
    match env::var("TERTERCHAT_CERT_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from("certificates"),
    }
}

/// Ensure the parent directory of a socket exists.
///
/// A directory created here is restricted to 0700 on Unix. An existing
/// directory is left as it is, since it may be shared (`/tmp`, a runtime dir).
pub fn ensure_socket_dir(socket_path: &std::path::Path) -> std::io::Result<()> {
    let Some(dir) = socket_path.parent() else {
        return Ok(());
    };
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}
