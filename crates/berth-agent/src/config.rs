use std::path::Path;

use berth_instance::{ExecutionMode, InstanceConfig};

use crate::paths::{InstanceLayout, layout_under};

/// Listening port inside a container; the host port is mapped onto it.
pub const CONTAINER_INTERNAL_PORT: u16 = 6379;

/// Mount point of the data directory inside a container.
pub const CONTAINER_DATA_DIR: &str = "/data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedConfig {
    pub text: String,
    pub layout: InstanceLayout,
}

/// Render the server configuration for one instance. Pure and deterministic:
/// identical (id, config, root) always yields identical text and paths.
pub fn generate(root: &Path, instance_id: &str, cfg: &InstanceConfig) -> GeneratedConfig {
    let layout = layout_under(root, instance_id);
    let mut out = String::new();
    let mut line = |s: &str| {
        out.push_str(s);
        out.push('\n');
    };

    match cfg.execution_mode {
        ExecutionMode::Docker => {
            // Containers are reached through a port mapping; inside the
            // container the server must listen on the fixed internal port and
            // accept connections from the bridge network.
            line(&format!("port {CONTAINER_INTERNAL_PORT}"));
            line("bind 0.0.0.0");
            line("protected-mode no");
            line(&format!("dir {CONTAINER_DATA_DIR}"));
        }
        ExecutionMode::Native => {
            line(&format!("port {}", cfg.port));
            line(&format!("bind {}", cfg.bind.as_deref().unwrap_or("127.0.0.1")));
            line("protected-mode yes");
            line(&format!("dir {}", layout.data_dir.display()));
        }
    }

    if let Some(mm) = cfg.maxmemory.as_deref().filter(|s| !s.trim().is_empty()) {
        line(&format!("maxmemory {}", mm.trim()));
    }
    if let Some(policy) = cfg.eviction_policy {
        line(&format!("maxmemory-policy {}", policy.as_directive()));
    }

    line(&format!(
        "appendonly {}",
        if cfg.appendonly { "yes" } else { "no" }
    ));
    if cfg.snapshotting {
        line("save 900 1");
        line("save 300 10");
        line("save 60 10000");
    } else {
        // Explicitly disable RDB snapshots; an empty config would inherit
        // the server's built-in schedule.
        line("save \"\"");
    }

    if let Some(pass) = cfg.password.as_deref().filter(|s| !s.is_empty()) {
        line(&format!("requirepass {pass}"));
    }
    if let Some(dbs) = cfg.databases {
        line(&format!("databases {dbs}"));
    }
    if let Some(timeout) = cfg.timeout_secs {
        line(&format!("timeout {timeout}"));
    }
    if let Some(level) = cfg.log_level {
        line(&format!("loglevel {}", level.as_directive()));
    }

    GeneratedConfig { text: out, layout }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_instance::{EvictionPolicy, LogLevel};

    fn root() -> &'static Path {
        Path::new("/srv/berth")
    }

    #[test]
    fn generation_is_deterministic() {
        let mut cfg = InstanceConfig::new(7000, ExecutionMode::Native);
        cfg.maxmemory = Some("256mb".to_string());
        cfg.eviction_policy = Some(EvictionPolicy::AllkeysLru);
        let a = generate(root(), "id-1", &cfg);
        let b = generate(root(), "id-1", &cfg);
        assert_eq!(a, b);
    }

    #[test]
    fn native_mode_uses_declared_bind_and_protected_mode() {
        let mut cfg = InstanceConfig::new(7000, ExecutionMode::Native);
        cfg.bind = Some("0.0.0.0".to_string());
        let g = generate(root(), "id-1", &cfg);
        assert!(g.text.contains("port 7000\n"));
        assert!(g.text.contains("bind 0.0.0.0\n"));
        assert!(g.text.contains("protected-mode yes\n"));
        assert!(g.text.contains("dir /srv/berth/instances/id-1/data\n"));
    }

    #[test]
    fn docker_mode_forces_internal_port_and_open_bind() {
        let cfg = InstanceConfig::new(7001, ExecutionMode::Docker);
        let g = generate(root(), "id-2", &cfg);
        assert!(g.text.contains("port 6379\n"));
        assert!(g.text.contains("bind 0.0.0.0\n"));
        assert!(g.text.contains("protected-mode no\n"));
        assert!(g.text.contains("dir /data\n"));
        // The declared port only matters for the host-side mapping.
        assert!(!g.text.contains("7001"));
    }

    #[test]
    fn snapshotting_toggle_controls_save_directives() {
        let on = generate(root(), "x", &InstanceConfig::new(7000, ExecutionMode::Native));
        assert!(on.text.contains("save 900 1\n"));
        assert!(on.text.contains("save 60 10000\n"));

        let mut cfg = InstanceConfig::new(7000, ExecutionMode::Native);
        cfg.snapshotting = false;
        let off = generate(root(), "x", &cfg);
        assert!(off.text.contains("save \"\"\n"));
        assert!(!off.text.contains("save 900"));
    }

    #[test]
    fn optional_directives_appear_only_when_set() {
        let bare = generate(root(), "x", &InstanceConfig::new(7000, ExecutionMode::Native));
        for absent in ["maxmemory", "requirepass", "databases", "timeout", "loglevel"] {
            assert!(!bare.text.contains(absent), "unexpected {absent}");
        }

        let mut cfg = InstanceConfig::new(7000, ExecutionMode::Native);
        cfg.password = Some("s3cret".to_string());
        cfg.databases = Some(4);
        cfg.timeout_secs = Some(300);
        cfg.log_level = Some(LogLevel::Warning);
        let full = generate(root(), "x", &cfg);
        assert!(full.text.contains("requirepass s3cret\n"));
        assert!(full.text.contains("databases 4\n"));
        assert!(full.text.contains("timeout 300\n"));
        assert!(full.text.contains("loglevel warning\n"));
    }
}
