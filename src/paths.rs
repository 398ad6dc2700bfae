//! Path translation between the host OS and the agent's execution namespace.
//!
//! On Windows the agent runs inside a WSL-style mount namespace, so host
//! paths like `C:\Users\dev` must be handed to the subprocess as
//! `/mnt/c/Users/dev`. Translation is best-effort: any path that doesn't
//! match the drive pattern (UNC shares, relative paths, already-POSIX
//! paths) passes through unchanged and the subprocess fails with an
//! ordinary filesystem error if it was wrong.

use std::path::{Path, PathBuf};

/// Convert a host path to the agent's namespace.
///
/// `C:\Users\dev` becomes `/mnt/c/Users/dev` (drive letter lowercased,
/// separators normalized). Paths without a drive prefix are returned as-is.
pub fn to_agent_path(host: &Path) -> String {
    let s = host.to_string_lossy();
    let bytes = s.as_bytes();
    let has_drive = bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes.len() == 2 || bytes[2] == b'\\' || bytes[2] == b'/');
    if !has_drive {
        return s.into_owned();
    }
    let drive = char::from(bytes[0].to_ascii_lowercase());
    let rest = s[2..].replace('\\', "/");
    format!("/mnt/{drive}{rest}")
}

/// Convert a path from the agent's namespace back to a host path.
///
/// `/mnt/c/Users/dev` becomes `C:\Users\dev`. Anything outside `/mnt/<drive>`
/// passes through unchanged.
///
/// The inverse is ambiguous for components that contain a literal `\`:
/// `/mnt/c/a\b` maps to `C:\a\b`, indistinguishable from a two-component
/// original. Such names don't occur on real Windows filesystems, so the
/// ambiguity is documented rather than resolved.
pub fn to_host_path(agent: &str) -> PathBuf {
    let Some(rest) = agent.strip_prefix("/mnt/") else {
        return PathBuf::from(agent);
    };
    let mut chars = rest.chars();
    let Some(drive) = chars.next() else {
        return PathBuf::from(agent);
    };
    if !drive.is_ascii_alphabetic() {
        return PathBuf::from(agent);
    }
    let tail = chars.as_str();
    if !tail.is_empty() && !tail.starts_with('/') {
        // Something like /mnt/cache, not a drive mount.
        return PathBuf::from(agent);
    }
    let drive = drive.to_ascii_uppercase();
    if tail.is_empty() || tail == "/" {
        return PathBuf::from(format!("{drive}:\\"));
    }
    PathBuf::from(format!("{drive}:{}", tail.replace('/', "\\")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_path_maps_to_mount() {
        assert_eq!(
            to_agent_path(Path::new(r"C:\Users\dev\project")),
            "/mnt/c/Users/dev/project"
        );
    }

    #[test]
    fn drive_letter_is_lowercased() {
        assert_eq!(to_agent_path(Path::new(r"D:\data")), "/mnt/d/data");
        assert_eq!(to_agent_path(Path::new(r"d:\data")), "/mnt/d/data");
    }

    #[test]
    fn forward_slash_drive_path_maps() {
        assert_eq!(to_agent_path(Path::new("C:/code/app")), "/mnt/c/code/app");
    }

    #[test]
    fn bare_drive_maps_to_mount_root() {
        assert_eq!(to_agent_path(Path::new("C:")), "/mnt/c");
    }

    #[test]
    fn unc_path_passes_through() {
        assert_eq!(
            to_agent_path(Path::new(r"\\server\share\dir")),
            r"\\server\share\dir"
        );
    }

    #[test]
    fn posix_path_passes_through() {
        assert_eq!(to_agent_path(Path::new("/home/dev/project")), "/home/dev/project");
        assert_eq!(to_agent_path(Path::new("relative/dir")), "relative/dir");
    }

    #[test]
    fn mount_path_maps_back_to_drive() {
        assert_eq!(
            to_host_path("/mnt/c/Users/dev"),
            PathBuf::from(r"C:\Users\dev")
        );
    }

    #[test]
    fn mount_root_maps_back_to_drive_root() {
        assert_eq!(to_host_path("/mnt/c"), PathBuf::from(r"C:\"));
        assert_eq!(to_host_path("/mnt/c/"), PathBuf::from(r"C:\"));
    }

    #[test]
    fn non_mount_paths_pass_through() {
        assert_eq!(to_host_path("/home/dev"), PathBuf::from("/home/dev"));
        assert_eq!(to_host_path("/mnt/cache/x"), PathBuf::from("/mnt/cache/x"));
        assert_eq!(to_host_path("/mnt/"), PathBuf::from("/mnt/"));
    }

    #[test]
    fn drive_round_trips() {
        let host = Path::new(r"C:\projects\app");
        assert_eq!(to_host_path(&to_agent_path(host)), host);
    }
}
