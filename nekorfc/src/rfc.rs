use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

/// A shareable document owned by one peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rfc {
    pub number: u32,
    pub title: String,

    /// Hostname of the owning peer
    pub hostname: String,

    /// Location of the content on the owning peer
    pub path: PathBuf,
}

impl Rfc {
    pub fn new(
        number: u32,
        title: impl Into<String>,
        hostname: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Rfc {
            number,
            title: title.into(),
            hostname: hostname.into(),
            path: path.into(),
        }
    }

    /// File name a downloaded copy is saved under
    pub fn file_name(&self) -> PathBuf {
        self.path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("rfc{}.txt", self.number)))
    }
}

/// A peer's own RFCs keyed by number
///
/// Built at startup and only read afterwards.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    rfcs: BTreeMap<u32, Rfc>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    /// Add `rfc`, replacing any entry with the same number
    pub fn insert(&mut self, rfc: Rfc) {
        self.rfcs.insert(rfc.number, rfc);
    }

    pub fn get(&self, number: u32) -> Option<&Rfc> {
        self.rfcs.get(&number)
    }

    /// RFCs in ascending number order
    pub fn iter(&self) -> impl Iterator<Item = &Rfc> {
        self.rfcs.values()
    }

    pub fn len(&self) -> usize {
        self.rfcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rfcs.is_empty()
    }

    /// Catalog every `rfc<N>.txt` file in `dir` as RFC `N` titled `rfc<N>`
    pub async fn from_dir(hostname: &str, dir: &Path) -> std::io::Result<Self> {
        let mut catalog = Catalog::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(number) = rfc_number(&path) else {
                continue;
            };
            if !entry.file_type().await?.is_file() {
                continue;
            }
            catalog.insert(Rfc::new(number, format!("rfc{number}"), hostname, path));
        }
        Ok(catalog)
    }
}

impl FromIterator<Rfc> for Catalog {
    fn from_iter<I: IntoIterator<Item = Rfc>>(iter: I) -> Self {
        let mut catalog = Catalog::new();
        iter.into_iter().for_each(|rfc| catalog.insert(rfc));
        catalog
    }
}

fn rfc_number(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("rfc")?.strip_suffix(".txt")?.parse().ok()
}
