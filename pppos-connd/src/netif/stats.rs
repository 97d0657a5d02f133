use color_eyre::Result;
use serde::Serialize;
use std::path::Path;
use tokio::fs;

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

impl NetStats {
    pub async fn collect(sysfs: impl AsRef<Path>, iface: &str) -> Result<NetStats> {
        let stats_path = sysfs
            .as_ref()
            .join("class")
            .join("net")
            .join(iface)
            .join("statistics");

        Ok(NetStats {
            tx_bytes: read_counter(&stats_path.join("tx_bytes")).await?,
            rx_bytes: read_counter(&stats_path.join("rx_bytes")).await?,
        })
    }
}

async fn read_counter(path: &Path) -> Result<u64> {
    let raw = fs::read(path).await?;
    Ok(String::from_utf8_lossy(&raw).trim().parse()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn it_reads_interface_counters() {
        let sysfs = tempfile::tempdir().unwrap();
        let stats = sysfs.path().join("class/net/ppp0/statistics");
        std::fs::create_dir_all(&stats).unwrap();
        std::fs::write(stats.join("tx_bytes"), "1337\n").unwrap();
        std::fs::write(stats.join("rx_bytes"), "42\n").unwrap();

        let actual = NetStats::collect(sysfs.path(), "ppp0").await.unwrap();

        assert_eq!(
            actual,
            NetStats {
                tx_bytes: 1337,
                rx_bytes: 42
            }
        );
    }

    #[tokio::test]
    async fn it_fails_for_a_missing_interface() {
        let sysfs = tempfile::tempdir().unwrap();

        assert!(NetStats::collect(sysfs.path(), "ppp0").await.is_err());
    }
}
