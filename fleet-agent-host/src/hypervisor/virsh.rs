use super::{parse_monitors, parse_size, templates, HypervisorError, Volume, VolumeUsage};
use crate::config::PoolSettings;
use crate::execution::shell::Shell;
use crate::model::StoragePool;
use crate::tabular::{self, Record};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use tracing::debug;

type Result<T> = std::result::Result<T, HypervisorError>;

#[derive(Debug, Deserialize)]
struct DuImage {
    name: String,
    provisioned_size: u64,
    used_size: u64,
}

#[derive(Debug, Deserialize)]
struct DuReport {
    #[serde(default)]
    images: Vec<DuImage>,
}

/// Thin async wrapper over the `virsh` and `rbd` command lines
#[derive(Clone)]
pub struct Virsh {
    shell: Arc<dyn Shell>,
    virsh: String,
    rbd: String,
    connect_uri: Option<String>,
}

impl Virsh {
    pub fn new(shell: Arc<dyn Shell>, settings: &PoolSettings) -> Self {
        Self {
            shell,
            virsh: settings.virsh.clone(),
            rbd: settings.rbd.clone(),
            connect_uri: settings.connect_uri.clone(),
        }
    }

    fn virsh_line(&self, args: &[&str]) -> String {
        let mut words: Vec<&str> = vec![self.virsh.as_str()];
        if let Some(uri) = &self.connect_uri {
            words.extend(["-c", uri.as_str()]);
        }
        words.extend_from_slice(args);
        shell_words::join(words)
    }

    async fn virsh(&self, args: &[&str]) -> Result<String> {
        let line = self.virsh_line(args);
        debug!("hypervisor: {}", line);
        Ok(self.shell.run(&line).await?)
    }

    async fn listing(&self, args: &[&str], key: &str) -> Result<BTreeMap<String, Record>> {
        let output = self.virsh(args).await?;
        if output.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(tabular::decode_keyed(&output, key)?)
    }

    /// Defined secrets keyed by UUID
    pub async fn secrets(&self) -> Result<BTreeMap<String, Record>> {
        self.listing(&["secret-list"], "UUID").await
    }

    /// Defined pools (active or not) keyed by name
    pub async fn pools(&self) -> Result<BTreeMap<String, Record>> {
        self.listing(&["pool-list", "--details", "--all"], "Name").await
    }

    /// Stage `document` in a temporary file for the duration of one `--file` command
    async fn define(&self, verb: &str, prefix: &str, document: &str) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".xml")
            .tempfile()?;
        file.write_all(document.as_bytes())?;
        file.flush()?;

        let path = file.path().to_string_lossy().to_string();
        self.virsh(&[verb, "--file", path.as_str()]).await?;
        Ok(())
    }

    pub async fn define_secret(&self, pool: &StoragePool) -> Result<()> {
        self.define("secret-define", "fleet-secret-", &templates::secret_xml(pool))
            .await
    }

    pub async fn set_secret_value(&self, uuid: &str, key: &str) -> Result<()> {
        self.virsh(&["secret-set-value", "--secret", uuid, "--base64", key])
            .await?;
        Ok(())
    }

    pub async fn define_pool(&self, pool: &StoragePool) -> Result<()> {
        let monitors = parse_monitors(&pool.monitor_addresses);
        self.define("pool-define", "fleet-pool-", &templates::pool_xml(pool, &monitors))
            .await
    }

    pub async fn autostart(&self, name: &str) -> Result<()> {
        self.virsh(&["pool-autostart", name]).await?;
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.virsh(&["pool-start", name]).await?;
        Ok(())
    }

    pub async fn refresh(&self, name: &str) -> Result<()> {
        self.virsh(&["pool-refresh", name]).await?;
        Ok(())
    }

    /// Volumes of a pool as listed by `vol-list --details`
    pub async fn volumes(&self, name: &str) -> Result<Vec<Volume>> {
        let output = self.virsh(&["vol-list", "--details", "--pool", name]).await?;
        if output.trim().is_empty() {
            return Ok(Vec::new());
        }
        let volumes = tabular::decode(&output)?
            .into_iter()
            .filter_map(|record| {
                let name = record.get("Name").filter(|n| !n.is_empty())?.clone();
                let size = |column: &str| record.get(column).and_then(|v| parse_size(v));
                Some(Volume {
                    path: record.get("Path").cloned().unwrap_or_default(),
                    capacity: size("Capacity"),
                    allocation: size("Allocation"),
                    name,
                })
            })
            .collect();
        Ok(volumes)
    }

    /// Actual usage of one image, straight from the Ceph cluster
    pub async fn usage(&self, pool: &StoragePool, volume: &str) -> Result<VolumeUsage> {
        let line = shell_words::join([
            self.rbd.as_str(),
            "du",
            "--format",
            "json",
            "--pool",
            pool.rbd_source_name.as_str(),
            "--id",
            pool.auth_user.as_str(),
            "-m",
            pool.monitor_addresses.as_str(),
            volume,
        ]);
        debug!("hypervisor: {}", line);
        let output = self.shell.run(&line).await?;

        let report: DuReport = serde_json::from_str(output.trim())
            .map_err(|e| HypervisorError::Usage(e.to_string()))?;
        report
            .images
            .into_iter()
            .find(|image| image.name == volume)
            .map(|image| VolumeUsage {
                provisioned: image.provisioned_size,
                used: image.used_size,
            })
            .ok_or_else(|| HypervisorError::Usage(format!("no entry for image {}", volume)))
    }
}
