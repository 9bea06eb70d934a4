//! File-backed ENUM: a JSON object of subscriber number to target URI.

use std::collections::HashMap;

use scscf_core::EnumService;

pub struct FileEnumService {
    mappings: HashMap<String, String>,
}

impl FileEnumService {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mappings: HashMap<String, String> = serde_json::from_str(&raw)?;
        Ok(FileEnumService { mappings })
    }
}

impl EnumService for FileEnumService {
    fn translate(&self, number: &str) -> Option<String> {
        self.mappings.get(number).cloned()
    }
}
