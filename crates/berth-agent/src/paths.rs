use std::path::PathBuf;

const INSTANCES_DIR: &str = "instances";

/// Root directory for instance state, for embedders that don't bring their
/// own. `BERTH_DATA_ROOT` overrides the `./data` default.
pub fn data_root() -> PathBuf {
    let raw = std::env::var("BERTH_DATA_ROOT").unwrap_or_else(|_| "./data".to_string());
    let p = PathBuf::from(raw);
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

/// Canonical on-disk layout for one instance. Pure, derived only from the
/// root and the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    pub instance_dir: PathBuf,
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
}

pub fn layout_under(root: &std::path::Path, instance_id: &str) -> InstanceLayout {
    let instance_dir = root.join(INSTANCES_DIR).join(instance_id);
    InstanceLayout {
        data_dir: instance_dir.join("data"),
        config_path: instance_dir.join("redis.conf"),
        instance_dir,
    }
}

/// Keep instance ids safe for filesystem paths and container names.
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_deterministic() {
        let root = std::path::Path::new("/var/lib/berth");
        let a = layout_under(root, "abc");
        let b = layout_under(root, "abc");
        assert_eq!(a, b);
        assert_eq!(a.config_path, root.join("instances/abc/redis.conf"));
        assert_eq!(a.data_dir, root.join("instances/abc/data"));
    }

    #[test]
    fn unsafe_ids_are_rejected() {
        assert!(is_safe_id("a-b_c.9"));
        assert!(!is_safe_id(""));
        assert!(!is_safe_id("../escape"));
        assert!(!is_safe_id("a b"));
        assert!(!is_safe_id("a/b"));
    }
}
