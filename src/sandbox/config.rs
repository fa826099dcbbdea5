use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_IMAGE: &str = "refinery-worker:latest";

/// Container settings for the Docker provider.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub memory: String,
    pub cpus: f64,
    pub network: Option<String>,
    pub volumes: HashMap<String, String>,
    pub env: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            memory: "4g".to_string(),
            cpus: 2.0,
            network: None,
            volumes: HashMap::new(),
            env: HashMap::new(),
        }
    }
}

/// Raw TOML structure for `.refinery/sandbox.toml`
#[derive(Debug, Deserialize)]
struct SandboxToml {
    sandbox: Option<SandboxSection>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    image: Option<String>,
    memory: Option<String>,
    cpus: Option<f64>,
    network: Option<String>,
    #[serde(default)]
    volumes: HashMap<String, String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

impl SandboxConfig {
    /// Load from `.refinery/sandbox.toml` under `base`; defaults if absent.
    pub fn load(base: &Path) -> Result<Self> {
        let path = base.join(".refinery").join("sandbox.toml");
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let raw: SandboxToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let mut config = Self::default();
        if let Some(section) = raw.sandbox {
            config.image = section.image.unwrap_or(config.image);
            config.memory = section.memory.unwrap_or(config.memory);
            config.cpus = section.cpus.unwrap_or(config.cpus);
            config.network = section.network;
            config.volumes = section.volumes;
            config.env = section.env;
        }
        Ok(config)
    }

    /// `docker run` flags for resources, mounts and environment, in a
    /// stable order.
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "--memory".to_string(),
            self.memory.clone(),
            "--cpus".to_string(),
            self.cpus.to_string(),
        ];
        if let Some(network) = &self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        let mut volumes: Vec<_> = self.volumes.iter().collect();
        volumes.sort();
        for (target, source) in volumes {
            args.push("-v".to_string());
            args.push(format!("{}:{}", source, target));
        }
        let mut env: Vec<_> = self.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args
    }
}
