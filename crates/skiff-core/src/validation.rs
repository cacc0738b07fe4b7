//! Input validation helpers shared by the creation pipeline and the codecs.

/// Checks a name against the hostname grammar: a letter first, letters,
/// digits and hyphens inside, a letter or digit last, at most 63 characters.
#[must_use]
pub fn valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap_or('-');
    if !first.is_ascii_alphabetic() {
        return false;
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return false;
    }
    name.chars()
        .next_back()
        .is_some_and(|c| c.is_ascii_alphanumeric())
}

/// Checks an IEEE 48-bit MAC address, colon-separated.
#[must_use]
pub fn valid_mac_address(mac: &str) -> bool {
    let groups: Vec<&str> = mac.split(':').collect();
    groups.len() == 6
        && groups
            .iter()
            .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Paths that may never be shadowed by a mount in the guest.
const DENIED_TARGET_PREFIXES: [&str; 11] = [
    "/bin", "/boot", "/dev", "/etc", "/lib", "/proc", "/root", "/sbin", "/sys", "/usr", "/var",
];

/// Returns true if the target path must not be mounted over.
#[must_use]
pub fn invalid_target_path(target: &str) -> bool {
    if !target.starts_with('/') {
        return true;
    }
    let cleaned = clean_path(target);
    if cleaned == "/" {
        return true;
    }
    DENIED_TARGET_PREFIXES.iter().any(|prefix| {
        cleaned == *prefix
            || cleaned
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Normalizes a path: collapses repeated separators, resolves `.` and `..`
/// components lexically, drops any trailing separator.
#[must_use]
pub fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() && !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_hostnames() {
        assert!(valid_hostname("primary"));
        assert!(valid_hostname("dev-box-2"));
        assert!(valid_hostname("a"));
    }

    #[test]
    fn test_invalid_hostnames() {
        assert!(!valid_hostname(""));
        assert!(!valid_hostname("2fast"));
        assert!(!valid_hostname("-dash"));
        assert!(!valid_hostname("trailing-"));
        assert!(!valid_hostname("under_score"));
        assert!(!valid_hostname(&"x".repeat(64)));
    }

    #[test]
    fn test_valid_mac_addresses() {
        assert!(valid_mac_address("52:54:00:aa:bb:cc"));
        assert!(valid_mac_address("52:54:00:AA:BB:CC"));
    }

    #[test]
    fn test_invalid_mac_addresses() {
        assert!(!valid_mac_address(""));
        assert!(!valid_mac_address("52:54:00:aa:bb"));
        assert!(!valid_mac_address("52-54-00-aa-bb-cc"));
        assert!(!valid_mac_address("52:54:00:aa:bb:cg"));
        assert!(!valid_mac_address("525:4:00:aa:bb:cc"));
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/home//user/./src/"), "/home/user/src");
        assert_eq!(clean_path("/home/user/../other"), "/home/other");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("rel/./path"), "rel/path");
    }

    #[test]
    fn test_invalid_target_paths() {
        assert!(invalid_target_path("/"));
        assert!(invalid_target_path("/etc"));
        assert!(invalid_target_path("/usr/share"));
        assert!(invalid_target_path("relative/path"));
        assert!(!invalid_target_path("/home/ubuntu/src"));
        assert!(!invalid_target_path("/mnt/data"));
        assert!(!invalid_target_path("/varnish"));
    }
}
