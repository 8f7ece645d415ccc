//! Host facts for exec-method and command-block conditions.

use std::env;
use std::path::Path;

use geneflow_core::command::EnvironmentProbe;

/// Answers probes against the engine host's filesystem and `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

impl EnvironmentProbe for SystemProbe {
    fn in_path(&self, program: &str) -> bool {
        if program.is_empty() {
            return false;
        }
        if program.contains('/') {
            return is_executable(Path::new(program));
        }
        let Some(search) = env::var_os("PATH") else {
            return false;
        };
        env::split_paths(&search).any(|dir| is_executable(&dir.join(program)))
    }

    fn file_exists(&self, path: &str) -> bool {
        Path::new(path).is_file()
    }

    fn dir_exists(&self, path: &str) -> bool {
        Path::new(path).is_dir()
    }
}
