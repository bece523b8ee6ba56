use std::path::Path;

use tracing::{debug, warn};

use crate::schema::{BrokerBackend, StreamsyncConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["streamsync.toml", "config.toml"];

/// Load config from an explicit path.
pub fn load_config(path: &Path) -> anyhow::Result<StreamsyncConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
    Ok(cfg)
}

/// Discover a config file in the working directory, then apply environment
/// overrides. Missing file means environment-only configuration.
pub fn discover_and_load() -> StreamsyncConfig {
    let mut cfg = StreamsyncConfig::default();
    for name in CONFIG_FILENAMES {
        let path = Path::new(name);
        if path.exists() {
            debug!(path = %path.display(), "loading config");
            match load_config(path) {
                Ok(loaded) => {
                    cfg = loaded;
                    break;
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                },
            }
        }
    }
    apply_env(&mut cfg);
    cfg
}

/// Environment overrides. `INSTANCE_ID` carries no `STREAMSYNC_` prefix;
/// it is the fleet-wide contract name.
fn apply_env(cfg: &mut StreamsyncConfig) {
    if let Ok(id) = std::env::var("INSTANCE_ID") {
        cfg.instance_id = id;
    }
    if let Ok(bind) = std::env::var("STREAMSYNC_BIND") {
        cfg.server.bind = bind;
    }
    if let Ok(port) = std::env::var("PORT")
        && let Ok(port) = port.parse()
    {
        cfg.server.port = port;
    }
    if let Ok(url) = std::env::var("REDIS_URL") {
        cfg.broker.redis_url = Some(url);
        cfg.broker.backend = BrokerBackend::Redis;
    }
    if let Ok(token) = std::env::var("STREAMSYNC_SERVICE_TOKEN") {
        cfg.auth.service_token = Some(token);
    }
}
