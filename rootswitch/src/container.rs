// ABOUTME: Container records and the directory scanner that decodes them.
// ABOUTME: Each subdirectory of <root>/containers holds one config.v2.json metadata document.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

const CONTAINERS_DIR: &str = "containers";
const METADATA_FILE: &str = "config.v2.json";

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Driver")]
    driver: String,
    #[serde(rename = "Config", default)]
    config: Option<ContainerConfig>,
}

#[derive(Debug, Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

/// One persisted container, as found on a host-app or host-extension store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    id: String,
    name: String,
    image: String,
    driver: String,
    labels: HashMap<String, String>,
    mount_path: Option<PathBuf>,
}

impl ContainerRecord {
    pub fn decode(json: &[u8]) -> serde_json::Result<Self> {
        let meta: Metadata = serde_json::from_slice(json)?;
        Ok(Self::from(meta))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    /// Where the container's writable filesystem is mounted, once it has been.
    pub fn mount_path(&self) -> Option<&Path> {
        self.mount_path.as_deref()
    }

    /// Records a successful mount. A record is mounted at most once.
    pub(crate) fn set_mount_path(&mut self, path: PathBuf) {
        debug_assert!(self.mount_path.is_none(), "container {} mounted twice", self.id);
        if self.mount_path.is_none() {
            self.mount_path = Some(path);
        }
    }
}

impl From<Metadata> for ContainerRecord {
    fn from(meta: Metadata) -> Self {
        Self {
            id: meta.id,
            name: meta.name,
            image: meta.image,
            driver: meta.driver,
            labels: meta.config.and_then(|c| c.labels).unwrap_or_default(),
            mount_path: None,
        }
    }
}

fn load_record(home: &Path) -> Result<ContainerRecord> {
    let path = home.join(METADATA_FILE);
    let decode_err = |reason: String| Error::Decode {
        path: path.clone(),
        reason,
    };
    let json = std::fs::read(&path).map_err(|e| decode_err(e.to_string()))?;
    let record = ContainerRecord::decode(&json).map_err(|e| decode_err(e.to_string()))?;
    debug!(id = %record.id, name = %record.name, driver = %record.driver, "decoded container");
    Ok(record)
}

/// Decode every container under `<root>/containers`, in file-name order.
///
/// Fails on the first directory whose metadata cannot be read; boot metadata
/// is either trustworthy as a whole or not at all.
pub fn scan(root: &Path) -> Result<Vec<ContainerRecord>> {
    let dir = root.join(CONTAINERS_DIR);
    let scan_err = |source| Error::Scan {
        path: dir.clone(),
        source,
    };

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(&dir).map_err(scan_err)? {
        let entry = entry.map_err(scan_err)?;
        if entry.file_type().map_err(scan_err)?.is_dir() {
            entries.push(entry);
        }
    }
    entries.sort_by_key(|e| e.file_name());

    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        debug!(dir = %entry.path().display(), "looking for container metadata");
        records.push(load_record(&entry.path())?);
    }
    Ok(records)
}

#[cfg(test)]
pub(crate) fn write_container(root: &Path, dir: &str, id: &str, driver: &str, labels: &[(&str, &str)]) {
    let home = root.join(CONTAINERS_DIR).join(dir);
    std::fs::create_dir_all(&home).unwrap();
    let labels: HashMap<&str, &str> = labels.iter().copied().collect();
    let doc = serde_json::json!({
        "ID": id,
        "Name": format!("/{dir}"),
        "Image": format!("sha256:{id}"),
        "Driver": driver,
        "State": { "Running": false },
        "Config": { "Labels": labels, "Hostname": id },
    });
    std::fs::write(home.join(METADATA_FILE), doc.to_string()).unwrap();
}
