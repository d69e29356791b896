//! File-backed identity store: a flat toml table of string keys.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use glint_core::IdentityStore;

pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        FileStore { path }
    }

    fn read_all(&self) -> anyhow::Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let s = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        toml::from_str(&s).with_context(|| format!("parsing {}", self.path.display()))
    }

    fn write_all(&self, map: &BTreeMap<String, String>) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let s = toml::to_string(map)?;
        std::fs::write(&self.path, s)
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

impl IdentityStore for FileStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.read_all()?.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut map = self.read_all()?;
        map.insert(key.to_string(), value.to_string());
        self.write_all(&map)
    }

    fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        let mut map = self.read_all()?;
        map.remove(key);
        self.write_all(&map)
    }
}
