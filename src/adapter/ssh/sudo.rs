// SPDX-License-Identifier: MPL-2.0

//! Privilege escalation via `sudo -A` with an ephemeral askpass helper.
//!
//! Mirrors the teacher's habit of shelling out to a helper script rather
//! than talking to PAM directly (see `package/providers/*` invoking
//! distro package managers as subprocesses).

use crate::error::{Error, Result};
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

/// Per-command sudo configuration (the `sudo()` chain method, §6 "SSH
/// adapter options").
#[derive(Clone)]
pub struct SudoOptions {
    pub password: Option<String>,
}

impl std::fmt::Debug for SudoOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SudoOptions")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A temporary askpass script that echoes the configured password once.
/// Deleted when dropped.
pub struct Askpass {
    script: NamedTempFile,
}

impl Askpass {
    pub fn write(password: &str) -> Result<Self> {
        let mut script = NamedTempFile::new().map_err(|source| Error::Spawn {
            command: "sudo askpass helper".into(),
            cwd: None,
            source,
        })?;
        writeln!(script, "#!/bin/sh\nprintf '%s\\n' {}", shell_escape::unix::escape(password.into()))
            .map_err(|source| Error::Spawn {
                command: "sudo askpass helper".into(),
                cwd: None,
                source,
            })?;
        let mut perms = script
            .as_file()
            .metadata()
            .map_err(|source| Error::Spawn {
                command: "sudo askpass helper".into(),
                cwd: None,
                source,
            })?
            .permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o700);
            script
                .as_file()
                .set_permissions(perms)
                .map_err(|source| Error::Spawn {
                    command: "sudo askpass helper".into(),
                    cwd: None,
                    source,
                })?;
        }
        Ok(Askpass { script })
    }

    pub fn path(&self) -> PathBuf {
        self.script.path().to_path_buf()
    }
}

/// Wrap a remote shell line so it runs under `sudo -A`, given an askpass
/// script path already staged on the remote end.
pub fn wrap_line(line: &str, askpass_remote_path: &str) -> String {
    format!(
        "SUDO_ASKPASS={} sudo -A -- sh -c {}",
        shell_escape::unix::escape(askpass_remote_path.into()),
        shell_escape::unix::escape(line.into())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_line_sets_askpass_and_preserves_command() {
        let wrapped = wrap_line("whoami", "/tmp/askpass.sh");
        assert!(wrapped.contains("SUDO_ASKPASS=/tmp/askpass.sh"));
        assert!(wrapped.contains("sudo -A"));
        assert!(wrapped.contains("whoami"));
    }

    #[test]
    fn askpass_script_is_created_and_executable() {
        let askpass = Askpass::write("hunter2").unwrap();
        let meta = std::fs::metadata(askpass.path()).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(meta.permissions().mode() & 0o777, 0o700);
        }
        let _ = meta;
    }
}
