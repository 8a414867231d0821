use std::{collections::BTreeMap, path::Path};

use crate::config::{AgentConfig, InstancePaths, write_atomic};
use crate::error::{Error, IoContext, Result};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server_name: String,
    pub server_port: u16,
    pub max_players: u32,
    pub gamemode: String,
    pub difficulty: String,
    pub pvp: bool,
    pub online_mode: bool,
    pub motd: String,
    pub view_distance: u32,
    pub spawn_protection: u32,
    /// Heap size such as `2G`; the agent default applies when unset.
    pub memory: Option<String>,
    /// Game content version; the agent default applies when unset.
    pub minecraft_version: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "CraftServer".to_string(),
            server_port: 25565,
            max_players: 20,
            gamemode: "survival".to_string(),
            difficulty: "normal".to_string(),
            pvp: true,
            online_mode: true,
            motd: "A Minecraft Server".to_string(),
            view_distance: 10,
            spawn_protection: 16,
            memory: None,
            minecraft_version: None,
        }
    }
}

impl ServerConfig {
    pub fn effective_memory(&self, agent: &AgentConfig) -> String {
        self.memory
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(&agent.default_memory)
            .to_string()
    }

    pub fn effective_version(&self, agent: &AgentConfig) -> String {
        self.minecraft_version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(&agent.default_version)
            .to_string()
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_port == 0 {
            return Err(Error::InvalidArgument("server_port must be non-zero".into()));
        }
        if let Some(mem) = &self.memory {
            parse_memory(mem)?;
        }
        for (key, value) in [("server_name", &self.server_name), ("motd", &self.motd)] {
            if value.contains('\n') || value.contains('\r') {
                return Err(Error::InvalidArgument(format!(
                    "{key} must be a single line"
                )));
            }
        }
        Ok(())
    }

    /// `server.properties` keys managed by the agent, in file order.
    fn managed_properties(&self) -> Vec<(&'static str, String)> {
        vec![
            ("server-name", self.server_name.clone()),
            ("server-port", self.server_port.to_string()),
            ("max-players", self.max_players.to_string()),
            ("gamemode", self.gamemode.clone()),
            ("difficulty", self.difficulty.clone()),
            ("pvp", self.pvp.to_string()),
            ("online-mode", self.online_mode.to_string()),
            ("motd", self.motd.clone()),
            ("view-distance", self.view_distance.to_string()),
            ("spawn-protection", self.spawn_protection.to_string()),
        ]
    }

    /// Overlay values found in an existing `server.properties`.
    fn apply_properties(&mut self, props: &BTreeMap<String, String>) {
        fn parse<T: std::str::FromStr>(v: Option<&String>, slot: &mut T) {
            if let Some(parsed) = v.and_then(|s| s.trim().parse::<T>().ok()) {
                *slot = parsed;
            }
        }

        if let Some(v) = props.get("server-name") {
            self.server_name = v.clone();
        }
        if let Some(v) = props.get("gamemode") {
            self.gamemode = v.clone();
        }
        if let Some(v) = props.get("difficulty") {
            self.difficulty = v.clone();
        }
        if let Some(v) = props.get("motd") {
            self.motd = v.clone();
        }
        parse(props.get("server-port"), &mut self.server_port);
        parse(props.get("max-players"), &mut self.max_players);
        parse(props.get("pvp"), &mut self.pvp);
        parse(props.get("online-mode"), &mut self.online_mode);
        parse(props.get("view-distance"), &mut self.view_distance);
        parse(props.get("spawn-protection"), &mut self.spawn_protection);
    }
}

/// Accepts `<digits>` optionally followed by one of `K`, `M`, `G` (any case)
/// and returns the normalized JVM form, e.g. `2g` -> `2G`.
pub fn parse_memory(raw: &str) -> Result<String> {
    let raw = raw.trim();
    let invalid = || Error::InvalidArgument(format!("invalid memory size {raw:?} (expected e.g. 2G)"));

    let (digits, unit) = match raw.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&raw[..raw.len() - 1], Some(c.to_ascii_uppercase())),
        _ => (raw, None),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    if value == 0 {
        return Err(invalid());
    }
    match unit {
        None => Ok(value.to_string()),
        Some(u @ ('K' | 'M' | 'G')) => Ok(format!("{value}{u}")),
        Some(_) => Err(invalid()),
    }
}

/// Parse `key=value` lines, skipping blanks and `#` comments.
pub fn parse_properties(raw: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in raw.lines() {
        let l = line.trim();
        if l.is_empty() || l.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = l.split_once('=') {
            out.insert(k.trim().to_string(), v.to_string());
        }
    }
    out
}

/// Rewrite managed keys in place, keep every other line untouched, and append
/// managed keys that were missing.
pub fn merge_properties(existing: &str, config: &ServerConfig) -> String {
    let managed = config.managed_properties();
    let mut written = vec![false; managed.len()];
    let mut out = String::new();

    if existing.trim().is_empty() {
        out.push_str("# Minecraft server properties\n");
    }

    for line in existing.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with('#')
            && let Some((k, _)) = trimmed.split_once('=')
            && let Some(idx) = managed.iter().position(|(name, _)| *name == k.trim())
        {
            let (name, value) = &managed[idx];
            out.push_str(&format!("{name}={value}\n"));
            written[idx] = true;
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }

    for ((name, value), done) in managed.iter().zip(written) {
        if !done {
            out.push_str(&format!("{name}={value}\n"));
        }
    }
    out
}

/// Load the stored configuration, falling back to defaults plus whatever the
/// game's own `server.properties` says.
pub async fn load(paths: &InstancePaths) -> Result<ServerConfig> {
    let path = paths.instance_config();
    let mut cfg = match tokio::fs::read(&path).await {
        Ok(raw) => serde_json::from_slice::<ServerConfig>(&raw)
            .io_context(|| format!("parse {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ServerConfig::default(),
        Err(e) => {
            return Err(Error::Io {
                context: format!("read {}", path.display()),
                source: e,
            });
        }
    };

    let props_path = paths.server_dir().join("server.properties");
    if let Ok(raw) = tokio::fs::read_to_string(&props_path).await {
        cfg.apply_properties(&parse_properties(&raw));
    }
    Ok(cfg)
}

/// Persist the configuration record and mirror it into `server.properties`.
pub async fn save(paths: &InstancePaths, cfg: &ServerConfig) -> Result<()> {
    cfg.validate()?;

    let path = paths.instance_config();
    let data = serde_json::to_vec_pretty(cfg).io_context(|| "serialize instance config".into())?;
    write_atomic(&path, &data)
        .await
        .io_context(|| format!("write {}", path.display()))?;

    write_properties(&paths.server_dir(), cfg).await
}

async fn write_properties(server_dir: &Path, cfg: &ServerConfig) -> Result<()> {
    let props_path = server_dir.join("server.properties");
    let existing = tokio::fs::read_to_string(&props_path)
        .await
        .unwrap_or_default();
    let merged = merge_properties(&existing, cfg);
    write_atomic(&props_path, merged.as_bytes())
        .await
        .io_context(|| format!("write {}", props_path.display()))
}

/// The game refuses to start until the EULA flag is present.
pub async fn write_eula(server_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(server_dir)
        .await
        .io_context(|| format!("create {}", server_dir.display()))?;
    let path = server_dir.join("eula.txt");
    tokio::fs::write(&path, b"eula=true\n")
        .await
        .io_context(|| format!("write {}", path.display()))
}
