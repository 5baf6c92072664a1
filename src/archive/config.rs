use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};

/// Image configuration.
///
/// Only the fields used to describe the image are parsed.
///
/// Ref: <https://github.com/opencontainers/image-spec/blob/main/config.md>
#[derive(Clone, Debug, Default, PartialEq, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    pub architecture: Option<String>,

    pub os: Option<String>,

    pub variant: Option<String>,

    pub created: Option<String>,

    #[serde(default, deserialize_with = "nullable")]
    pub config: ContainerConfig,

    #[serde(default, deserialize_with = "nullable")]
    pub rootfs: RootFs,

    #[serde(default, deserialize_with = "nullable")]
    pub history: Vec<HistoryEntry>,
}

/// Execution parameters for containers created from the image.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    pub user: Option<String>,

    #[serde(default, deserialize_with = "nullable")]
    pub env: Vec<String>,

    pub entrypoint: Option<Vec<String>>,

    pub cmd: Option<Vec<String>>,

    pub working_dir: Option<String>,

    #[serde(default, deserialize_with = "nullable")]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,

    #[serde(default, deserialize_with = "nullable")]
    pub labels: BTreeMap<String, String>,

    pub stop_signal: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, serde::Serialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: Option<String>,

    #[serde(default, deserialize_with = "nullable")]
    pub diff_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, serde::Serialize)]
pub struct HistoryEntry {
    pub created: Option<String>,

    pub created_by: Option<String>,

    pub author: Option<String>,

    pub comment: Option<String>,

    #[serde(default)]
    pub empty_layer: bool,
}

impl ImageConfig {
    /// Platform of the image, as `os/architecture`.
    pub fn platform(&self) -> Option<String> {
        match (&self.os, &self.architecture) {
            (Some(os), Some(arch)) => Some(format!("{os}/{arch}")),
            _ => None,
        }
    }
}

/// Use the default value when a field is `null`.
///
/// Docker writes `null` instead of omitting empty lists and maps.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[test]
fn parse_docker_config() {
    let json = r#"{
        "architecture": "amd64",
        "os": "linux",
        "created": "2024-06-20T20:16:57Z",
        "config": {
            "Env": ["PATH=/usr/bin"],
            "Cmd": ["/bin/sh"],
            "Labels": null,
            "ExposedPorts": {"80/tcp": {}},
            "WorkingDir": ""
        },
        "rootfs": {
            "type": "layers",
            "diff_ids": ["sha256:aaaa", "sha256:bbbb"]
        },
        "history": [
            {"created_by": "ADD file:abc in /"},
            {"created_by": "CMD [\"/bin/sh\"]", "empty_layer": true}
        ]
    }"#;

    let config: ImageConfig = serde_json::from_str(json).unwrap();

    assert_eq!(config.platform().as_deref(), Some("linux/amd64"));
    assert_eq!(config.config.env, ["PATH=/usr/bin"]);
    assert_eq!(config.config.cmd.as_deref(), Some(&["/bin/sh".to_owned()][..]));
    assert!(config.config.labels.is_empty());
    assert!(config.config.exposed_ports.contains_key("80/tcp"));
    assert_eq!(config.rootfs.diff_ids.len(), 2);
    assert!(config.history[1].empty_layer);
}

#[test]
fn parse_minimal_config() {
    let config: ImageConfig = serde_json::from_str(r#"{"config": null}"#).unwrap();
    assert_eq!(config.platform(), None);
    assert!(config.rootfs.diff_ids.is_empty());
}
