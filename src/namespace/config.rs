use std::path::Path;

use anyhow::Context;
use serde::Deserialize;


/// The name space configuration file: a list of backends, queried in the order given.
///
/// ```toml
/// [[namespace]]
/// mode = "yarp-registry"
/// address = "tcp://127.0.0.1:10000/root"
///
/// [[namespace]]
/// mode = "foreign-bridge"
/// address = "tcp://127.0.0.1:11311"
/// ```
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
pub struct NameSpaceConfig {
    #[serde(default)]
    pub namespace: Vec<NameSpaceEntry>,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct NameSpaceEntry {
    pub mode: NameSpaceMode,
    /// the registry's address, required for remote modes
    pub address: Option<String>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NameSpaceMode {
    YarpRegistry,
    ForeignBridge,
    Local,
}

impl NameSpaceConfig {
    pub fn parse(s: &str) -> anyhow::Result<NameSpaceConfig> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<NameSpaceConfig> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading name space configuration {:?}", path))?;
        NameSpaceConfig::parse(&s)
            .with_context(|| format!("parsing name space configuration {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let config = NameSpaceConfig::parse(r#"
            [[namespace]]
            mode = "yarp-registry"
            address = "tcp://127.0.0.1:10000/root"

            [[namespace]]
            mode = "foreign-bridge"
            address = "tcp://127.0.0.1:11311"

            [[namespace]]
            mode = "local"
        "#).unwrap();

        assert_eq!(config.namespace, vec![
            NameSpaceEntry { mode: NameSpaceMode::YarpRegistry, address: Some("tcp://127.0.0.1:10000/root".to_string()) },
            NameSpaceEntry { mode: NameSpaceMode::ForeignBridge, address: Some("tcp://127.0.0.1:11311".to_string()) },
            NameSpaceEntry { mode: NameSpaceMode::Local, address: None },
        ]);
    }

    #[test]
    fn test_empty() {
        assert_eq!(NameSpaceConfig::parse("").unwrap(), NameSpaceConfig::default());
    }

    #[test]
    fn test_unknown_mode() {
        assert!(NameSpaceConfig::parse("[[namespace]]\nmode = \"carrier-pigeon\"\n").is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(NameSpaceConfig::load(Path::new("/nonexistent/namespace.toml")).is_err());
    }
}
