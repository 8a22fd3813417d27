//! Agent target configuration.
//!
//! The agent loads its scrape targets from a TOML file:
//!
//! ```toml
//! [[targets]]
//! path = "app1_metrics"
//! url = "http://localhost:9100/metrics"
//!
//! [[targets]]
//! path = "app2_metrics"
//! url = "http://localhost:9101/metrics"
//! ```
//!
//! Each entry claims one proxy path and names the URL fetched when that
//! path is scraped.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TargetsFile {
    #[serde(default)]
    targets: Vec<TargetEntry>,
}

/// One configured scrape target.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetEntry {
    pub path: String,
    pub url: String,
}

/// Load and validate the targets file.
pub fn load(path: &Path) -> anyhow::Result<Vec<TargetEntry>> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| anyhow::anyhow!("cannot read config file {}: {err}", path.display()))?;
    parse(&text)
}

fn parse(text: &str) -> anyhow::Result<Vec<TargetEntry>> {
    let file: TargetsFile = toml::from_str(text)?;
    anyhow::ensure!(!file.targets.is_empty(), "no [[targets]] configured");

    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(file.targets.len());
    for mut target in file.targets {
        target.path = target.path.trim_start_matches('/').to_string();
        anyhow::ensure!(!target.path.is_empty(), "target with empty path");
        anyhow::ensure!(!target.url.is_empty(), "target /{} has empty url", target.path);
        anyhow::ensure!(
            seen.insert(target.path.clone()),
            "duplicate target path /{}",
            target.path
        );
        targets.push(target);
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_targets() {
        let targets = parse(
            r#"
            [[targets]]
            path = "app1_metrics"
            url = "http://localhost:9100/metrics"

            [[targets]]
            path = "/app2_metrics"
            url = "http://localhost:9101/metrics"
            "#,
        )
        .unwrap();

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].path, "app1_metrics");
        // Leading slash is normalized away.
        assert_eq!(targets[1].path, "app2_metrics");
    }

    #[test]
    fn rejects_empty_file() {
        assert!(parse("").is_err());
        assert!(parse("targets = []").is_err());
    }

    #[test]
    fn rejects_duplicate_paths() {
        let err = parse(
            r#"
            [[targets]]
            path = "metrics"
            url = "http://a:1/metrics"

            [[targets]]
            path = "metrics"
            url = "http://b:2/metrics"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_missing_url() {
        assert!(parse(
            r#"
            [[targets]]
            path = "metrics"
            url = ""
            "#,
        )
        .is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("targets.toml");
        std::fs::write(
            &file,
            "[[targets]]\npath = \"metrics\"\nurl = \"http://localhost:9100/metrics\"\n",
        )
        .unwrap();

        let targets = load(&file).unwrap();
        assert_eq!(targets[0].url, "http://localhost:9100/metrics");
    }
}
