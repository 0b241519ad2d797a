use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use wasi_farm_park::ParkConfig;
use wasi_farm_runtime::FarmConfig;

use crate::run::Result;

/// Contents of a `--config` file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub park: ParkConfig,
    pub farm: FarmConfig,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_are_optional() {
        let settings: Settings = serde_json::from_str(r#"{"farm": {"max_threads": 4}}"#).unwrap();
        assert_eq!(settings.park, ParkConfig::default());
        assert_eq!(settings.farm.max_threads, 4);
    }
}
