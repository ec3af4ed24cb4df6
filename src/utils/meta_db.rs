use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::message::TopicMeta;
use crate::AppResult;

/// JSON-file store for topic metadata. Small enough to rewrite whole on
/// every save; loaded once at engine bootstrap.
#[derive(Debug)]
pub struct MetaDb {
    path: PathBuf,
    topics: HashMap<String, TopicMeta>,
}

impl MetaDb {
    /// Opens the db file, creating an empty one if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> AppResult<MetaDb> {
        let path = PathBuf::from(path.as_ref());
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let topics = if contents.is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(&contents)?
        };
        Ok(MetaDb { path, topics })
    }

    pub fn put(&mut self, meta: TopicMeta) {
        self.topics.insert(meta.name.clone(), meta);
    }

    pub fn get(&self, name: &str) -> Option<&TopicMeta> {
        self.topics.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<TopicMeta> {
        self.topics.remove(name)
    }

    pub fn topics(&self) -> impl Iterator<Item = &TopicMeta> {
        self.topics.values()
    }

    pub fn save(&self) -> AppResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let contents = serde_json::to_string_pretty(&self.topics)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}
