//! Kernel tunable I/O.
//!
//! Tunables are files under `/proc/sys` addressed by dotted name
//! (`net.ipv4.tcp_wmem` lives at `/proc/sys/net/ipv4/tcp_wmem`) holding a
//! newline-terminated, whitespace-separated tuple of 1 to 3 integers. A few
//! tunables live elsewhere in procfs and are addressed by literal path.
//!
//! Both roots can be redirected to a plain directory, which is how the
//! tests exercise the full write policy without touching the host kernel.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::CoreError;
use crate::tuner::TunableKind;

/// Tunable file accessor with redirectable roots.
#[derive(Debug, Clone)]
pub struct Sysctl {
    sysctl_root: PathBuf,
    procfs_root: PathBuf,
}

impl Default for Sysctl {
    fn default() -> Self {
        Self::new()
    }
}

impl Sysctl {
    /// Accessor over the real `/proc/sys`.
    pub fn new() -> Self {
        Sysctl {
            sysctl_root: PathBuf::from("/proc/sys"),
            procfs_root: PathBuf::from("/"),
        }
    }

    /// Accessor rooted at an arbitrary directory (tests).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Sysctl {
            sysctl_root: root.clone(),
            procfs_root: root,
        }
    }

    /// Filesystem path for a tunable name of the given kind. `None` for
    /// [`TunableKind::Other`], which is not file-backed.
    pub fn path_for(&self, kind: TunableKind, name: &str) -> Option<PathBuf> {
        match kind {
            TunableKind::Sysctl => Some(self.sysctl_root.join(name.replace('.', "/"))),
            TunableKind::Procfs => Some(self.procfs_root.join(name.trim_start_matches('/'))),
            TunableKind::Other => None,
        }
    }

    /// Read up to `arity` integer components for a tunable. Unused
    /// components of the returned array are zero.
    pub fn read(&self, kind: TunableKind, name: &str, arity: usize) -> Result<[i64; 3], CoreError> {
        let path = self
            .path_for(kind, name)
            .ok_or_else(|| CoreError::SysctlReadFailed {
                name: name.to_string(),
                source: not_file_backed(),
            })?;
        let contents = fs::read_to_string(&path).map_err(|source| CoreError::SysctlReadFailed {
            name: name.to_string(),
            source,
        })?;
        parse_tuple(&contents, arity).map_err(|source| CoreError::SysctlReadFailed {
            name: name.to_string(),
            source,
        })
    }

    /// Write `values` as a whitespace-separated, newline-terminated tuple.
    pub fn write(&self, kind: TunableKind, name: &str, values: &[i64]) -> Result<(), CoreError> {
        let path = self
            .path_for(kind, name)
            .ok_or_else(|| CoreError::SysctlWriteFailed {
                name: name.to_string(),
                source: not_file_backed(),
            })?;
        let line = format_tuple(values);
        fs::write(&path, line).map_err(|source| CoreError::SysctlWriteFailed {
            name: name.to_string(),
            source,
        })
    }

    /// Create the backing file for a tunable under a redirected root.
    /// Only meaningful in tests; the kernel owns the real files.
    pub fn seed(&self, kind: TunableKind, name: &str, values: &[i64]) -> Result<(), CoreError> {
        let path = self
            .path_for(kind, name)
            .ok_or_else(|| CoreError::Io(not_file_backed()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format_tuple(values)).map_err(CoreError::Io)
    }

    /// True when this accessor points at the live kernel surface.
    pub fn is_live(&self) -> bool {
        self.sysctl_root == Path::new("/proc/sys")
    }
}

/// Sysctl access with an optional namespace scope.
///
/// `scope` is a namespace cookie: `None` targets the global namespace,
/// `Some(cookie)` requires the implementation to perform the access from
/// inside the namespace the cookie identifies. The registry decides the
/// scope; implementations decide how to get there.
pub trait ScopedSysctl: Send {
    fn read(
        &mut self,
        scope: Option<i64>,
        kind: TunableKind,
        name: &str,
        arity: usize,
    ) -> Result<[i64; 3], CoreError>;

    fn write(
        &mut self,
        scope: Option<i64>,
        kind: TunableKind,
        name: &str,
        values: &[i64],
    ) -> Result<(), CoreError>;

    /// Invalidate any cached handle for a destroyed namespace.
    fn forget_namespace(&mut self, _cookie: i64) {}
}

fn not_file_backed() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "tunable is not file-backed")
}

fn format_tuple(values: &[i64]) -> String {
    let mut line = values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\t");
    line.push('\n');
    line
}

fn parse_tuple(contents: &str, arity: usize) -> Result<[i64; 3], io::Error> {
    let mut values = [0i64; 3];
    let mut count = 0;
    for field in contents.split_whitespace() {
        if count >= arity.min(3) {
            break;
        }
        values[count] = field
            .parse::<i64>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        count += 1;
    }
    if count < arity.min(3) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected {} components, found {}", arity, count),
        ));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_dotted_name_maps_to_slashed_path() {
        let sysctl = Sysctl::with_root("/tmp/x");
        assert_eq!(
            sysctl.path_for(TunableKind::Sysctl, "net.ipv4.tcp_wmem"),
            Some(PathBuf::from("/tmp/x/net/ipv4/tcp_wmem"))
        );
        assert_eq!(
            sysctl.path_for(TunableKind::Procfs, "/proc/net/softnet_stat"),
            Some(PathBuf::from("/tmp/x/proc/net/softnet_stat"))
        );
        assert_eq!(sysctl.path_for(TunableKind::Other, "anything"), None);
    }

    #[test]
    fn test_non_file_backed_tunable_is_rejected() {
        let dir = tempdir().unwrap();
        let sysctl = Sysctl::with_root(dir.path());
        assert!(matches!(
            sysctl.read(TunableKind::Other, "fancy.counter", 1),
            Err(CoreError::SysctlReadFailed { .. })
        ));
        assert!(matches!(
            sysctl.write(TunableKind::Other, "fancy.counter", &[1]),
            Err(CoreError::SysctlWriteFailed { .. })
        ));
    }

    #[test]
    fn test_read_write_round_trip() {
        let dir = tempdir().unwrap();
        let sysctl = Sysctl::with_root(dir.path());
        sysctl
            .seed(TunableKind::Sysctl, "net.ipv4.tcp_wmem", &[4096, 16384, 65536])
            .unwrap();

        let values = sysctl
            .read(TunableKind::Sysctl, "net.ipv4.tcp_wmem", 3)
            .unwrap();
        assert_eq!(values, [4096, 16384, 65536]);

        sysctl
            .write(TunableKind::Sysctl, "net.ipv4.tcp_wmem", &[4096, 16384, 262144])
            .unwrap();
        let values = sysctl
            .read(TunableKind::Sysctl, "net.ipv4.tcp_wmem", 3)
            .unwrap();
        assert_eq!(values, [4096, 16384, 262144]);
    }

    #[test]
    fn test_single_component_tunable() {
        let dir = tempdir().unwrap();
        let sysctl = Sysctl::with_root(dir.path());
        sysctl
            .seed(TunableKind::Sysctl, "net.core.somaxconn", &[128])
            .unwrap();
        let values = sysctl
            .read(TunableKind::Sysctl, "net.core.somaxconn", 1)
            .unwrap();
        assert_eq!(values, [128, 0, 0]);
    }

    #[test]
    fn test_short_tuple_is_an_error() {
        let dir = tempdir().unwrap();
        let sysctl = Sysctl::with_root(dir.path());
        sysctl
            .seed(TunableKind::Sysctl, "net.ipv4.tcp_rmem", &[4096])
            .unwrap();
        assert!(matches!(
            sysctl.read(TunableKind::Sysctl, "net.ipv4.tcp_rmem", 3),
            Err(CoreError::SysctlReadFailed { .. })
        ));
    }

    #[test]
    fn test_missing_tunable_is_a_read_error() {
        let dir = tempdir().unwrap();
        let sysctl = Sysctl::with_root(dir.path());
        assert!(matches!(
            sysctl.read(TunableKind::Sysctl, "net.ipv4.nope", 1),
            Err(CoreError::SysctlReadFailed { .. })
        ));
    }
}
