use std::path::PathBuf;

/// Resolve an executable name to an absolute path via PATH lookup.
///
/// Spawning through the resolved path turns a missing binary into a typed
/// error at the call site instead of an opaque ENOENT from the OS.
pub fn resolve_executable_path(name: &str) -> Option<PathBuf> {
    let p = PathBuf::from(name);
    if p.is_absolute() {
        return p.is_file().then_some(p);
    }
    which::which(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_sh_from_path() {
        assert!(resolve_executable_path("sh").is_some());
    }

    #[test]
    fn missing_binary_resolves_to_none() {
        assert!(resolve_executable_path("definitely-not-a-real-binary-xyz").is_none());
    }

    #[test]
    fn absolute_path_is_checked_for_existence() {
        assert!(resolve_executable_path("/bin/sh").is_some());
        assert!(resolve_executable_path("/no/such/file").is_none());
    }
}
