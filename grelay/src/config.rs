//! # Configuration
//!
//! The YAML boot file of `grelay`. Each entry of the `grpc` list describes one server and,
//! optionally, the proxy rules applied to the calls it does not implement.
//!
//! ```yaml
//! grpc:
//!   - name: greeter
//!     port: 8080
//!     connectTimeoutMs: 3000
//!     proxy:
//!       enabled: true
//!       rules:
//!         - type: headerBased
//!           headerPairs: ["x-tenant:blue"]
//!           dest: ["localhost:8082"]
//!         - type: pathBased
//!           paths: ["^/Greeter/"]
//!           dest: ["localhost:8081"]
//! ```
use anyhow::{Context, bail};
use grelay_core::director::DialOptions;
use grelay_core::rule::{HeaderPattern, IpPattern, PathPattern, Rule};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub grpc: Vec<GrpcEntryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcEntryConfig {
    pub name: String,
    pub port: u16,
    /// Dial timeout for backends, in milliseconds.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleConfig {
    HeaderBased {
        /// `key:value` pairs, split at the first colon.
        #[serde(default, rename = "headerPairs")]
        header_pairs: Vec<String>,
        #[serde(default)]
        dest: Vec<String>,
    },
    PathBased {
        #[serde(default)]
        paths: Vec<String>,
        #[serde(default)]
        dest: Vec<String>,
    },
    IpBased {
        #[serde(default)]
        ips: Vec<String>,
        #[serde(default)]
        dest: Vec<String>,
    },
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;

        Self::from_yaml(&raw)
            .with_context(|| format!("Invalid config file '{}'", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;

        for entry in &config.grpc {
            if config.grpc.iter().filter(|other| other.name == entry.name).count() > 1 {
                bail!("Duplicate gRPC entry name '{}'", entry.name);
            }
        }

        Ok(config)
    }
}

impl GrpcEntryConfig {
    pub fn dial_options(&self) -> DialOptions {
        DialOptions {
            connect_timeout: self.connect_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Builds the proxy rule of this entry, or `None` when its proxy is disabled.
    ///
    /// Patterns keep their declaration order within each kind.
    pub fn rule(&self) -> anyhow::Result<Option<Rule>> {
        if !self.proxy.enabled {
            return Ok(None);
        }

        let mut ip_patterns = Vec::new();
        let mut path_patterns = Vec::new();
        let mut header_patterns = Vec::new();

        for (index, rule) in self.proxy.rules.iter().enumerate() {
            let context = || format!("Invalid proxy rule #{index} of entry '{}'", self.name);

            match rule {
                RuleConfig::HeaderBased { header_pairs, dest } => {
                    let pattern = HeaderPattern::new(parse_header_pairs(header_pairs), dest.clone())
                        .with_context(context)?;
                    header_patterns.push(pattern);
                }
                RuleConfig::PathBased { paths, dest } => {
                    let pattern = PathPattern::new(paths, dest.clone()).with_context(context)?;
                    path_patterns.push(pattern);
                }
                RuleConfig::IpBased { ips, dest } => {
                    let pattern = IpPattern::new(ips, dest.clone()).with_context(context)?;
                    ip_patterns.push(pattern);
                }
            }
        }

        Ok(Some(
            Rule::new()
                .with_ip_patterns(ip_patterns)
                .with_path_patterns(path_patterns)
                .with_header_patterns(header_patterns),
        ))
    }
}

/// A later pair for the same key replaces the earlier one. Pairs without a colon are skipped.
fn parse_header_pairs(pairs: &[String]) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    for pair in pairs {
        match pair.split_once(':') {
            Some((key, value)) => {
                headers.insert(key.to_string(), value.to_string());
            }
            None => warn!(pair = %pair, "Skipping malformed header pair"),
        }
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
grpc:
  - name: greeter
    port: 8080
    connectTimeoutMs: 3000
    proxy:
      enabled: true
      rules:
        - type: headerBased
          headerPairs: ["x-tenant:blue", "broken", "x-trace:a:b"]
          dest: ["localhost:8082"]
        - type: pathBased
          paths: ["^/Greeter/"]
          dest: ["localhost:8081", "localhost:8083"]
        - type: ipBased
          ips: ["192.168.0.0/24"]
          dest: ["localhost:8084"]
  - name: plain
    port: 8090
"#;

    #[test]
    fn test_parses_every_rule_kind() {
        let config = Config::from_yaml(EXAMPLE).unwrap();

        assert_eq!(config.grpc.len(), 2);

        let greeter = &config.grpc[0];
        assert_eq!(greeter.name, "greeter");
        assert_eq!(greeter.port, 8080);
        assert_eq!(
            greeter.dial_options().connect_timeout,
            Some(Duration::from_secs(3))
        );
        assert!(greeter.proxy.enabled);
        assert_eq!(
            greeter.proxy.rules[1],
            RuleConfig::PathBased {
                paths: vec!["^/Greeter/".into()],
                dest: vec!["localhost:8081".into(), "localhost:8083".into()],
            }
        );

        let plain = &config.grpc[1];
        assert!(!plain.proxy.enabled);
        assert!(plain.proxy.rules.is_empty());
        assert_eq!(plain.dial_options().connect_timeout, None);
    }

    #[test]
    fn test_builds_the_rule_of_an_entry() {
        let config = Config::from_yaml(EXAMPLE).unwrap();

        let rule = config.grpc[0].rule().unwrap().unwrap();

        assert_eq!(rule.ip_patterns().len(), 1);
        assert_eq!(rule.path_patterns().len(), 1);
        assert_eq!(rule.header_patterns().len(), 1);
        assert_eq!(
            rule.path_patterns()[0].destinations(),
            ["localhost:8081", "localhost:8083"]
        );

        let mut headers = rule.header_patterns()[0].headers().to_vec();
        headers.sort();
        assert_eq!(
            headers,
            vec![
                ("x-tenant".to_string(), "blue".to_string()),
                ("x-trace".to_string(), "a:b".to_string()),
            ]
        );
    }

    #[test]
    fn test_disabled_proxies_have_no_rule() {
        let config = Config::from_yaml(EXAMPLE).unwrap();

        assert!(config.grpc[1].rule().unwrap().is_none());
    }

    #[test]
    fn test_later_header_pairs_win() {
        let headers = parse_header_pairs(&["k:a".to_string(), "k:b".to_string()]);

        assert_eq!(headers.get("k").map(String::as_str), Some("b"));
    }

    #[test]
    fn test_rejects_unknown_rule_types() {
        let raw = r#"
grpc:
  - name: greeter
    port: 8080
    proxy:
      enabled: true
      rules:
        - type: weightBased
          dest: ["localhost:8081"]
"#;

        assert!(Config::from_yaml(raw).is_err());
    }

    #[test]
    fn test_rejects_rules_without_destinations() {
        let raw = r#"
grpc:
  - name: greeter
    port: 8080
    proxy:
      enabled: true
      rules:
        - type: pathBased
          paths: ["^/Greeter/"]
"#;

        let config = Config::from_yaml(raw).unwrap();
        let err = config.grpc[0].rule().unwrap_err();

        assert!(err.to_string().contains("Invalid proxy rule #0 of entry 'greeter'"));
    }

    #[test]
    fn test_rejects_duplicate_entry_names() {
        let raw = r#"
grpc:
  - name: greeter
    port: 8080
  - name: greeter
    port: 8081
"#;

        let err = Config::from_yaml(raw).unwrap_err();
        assert!(err.to_string().contains("Duplicate gRPC entry name 'greeter'"));
    }
}
