//! MCU model database, keyed by the 16-bit magic from the identify response.

use std::fmt;

use serde::Deserialize;

use crate::error::{Error, Result};

/// One supported part, with family defaults folded in.
#[derive(Debug, Clone)]
pub struct McuModel {
    pub name: String,
    pub magic: u16,
    /// Total programmable space in bytes.
    pub total: u32,
    pub code: u32,
    pub eeprom: u32,
    /// Code/EEPROM split is a device option written at programming time.
    pub iap: bool,
    /// Internal RC oscillator can be trimmed over ISP.
    pub rc_trim: bool,
    pub mcs251: bool,
    /// Flash write block size in bytes.
    pub block: usize,
    /// Coarse hint for how long a whole-chip erase may take.
    pub erase_wait_secs: u64,
}

impl fmt::Display for McuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04X})", self.name, self.magic)
    }
}

impl McuModel {
    pub fn code_kb(&self) -> f64 {
        self.code as f64 / 1024.0
    }

    pub fn eeprom_kb(&self) -> f64 {
        self.eeprom as f64 / 1024.0
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Family {
    name: String,
    #[allow(dead_code)]
    description: String,
    #[serde(deserialize_with = "parse_size")]
    block: u32,
    #[serde(default = "default_erase_wait")]
    erase_wait_secs: u64,
    #[serde(default)]
    rc_trim: bool,
    #[serde(default)]
    iap: bool,
    variants: Vec<Variant>,
}

#[derive(Debug, Clone, Deserialize)]
struct Variant {
    name: String,
    #[serde(deserialize_with = "parse_magic")]
    magic: u16,
    #[serde(deserialize_with = "parse_size")]
    total: u32,
    #[serde(deserialize_with = "parse_size")]
    code: u32,
    #[serde(default, deserialize_with = "parse_size_opt")]
    eeprom: Option<u32>,
    iap: Option<bool>,
    mcs251: Option<bool>,
    #[serde(default, deserialize_with = "parse_size_opt")]
    block: Option<u32>,
}

fn default_erase_wait() -> u64 {
    30
}

pub struct ModelDb {
    families: Vec<Family>,
}

impl ModelDb {
    pub fn load() -> Result<Self> {
        let sources = [
            include_str!("../devices/stc89.yaml"),
            include_str!("../devices/stc12a.yaml"),
            include_str!("../devices/stc12b.yaml"),
            include_str!("../devices/stc12.yaml"),
            include_str!("../devices/stc15a.yaml"),
            include_str!("../devices/stc15.yaml"),
            include_str!("../devices/stc8.yaml"),
            include_str!("../devices/stc8h.yaml"),
        ];
        let families = sources
            .iter()
            .map(|src| {
                serde_yaml::from_str(src)
                    .map_err(|e| Error::Protocol(format!("model database is broken: {}", e)))
            })
            .collect::<Result<Vec<Family>>>()?;
        Ok(ModelDb { families })
    }

    fn resolve(family: &Family, v: &Variant) -> McuModel {
        McuModel {
            name: v.name.clone(),
            magic: v.magic,
            total: v.total,
            code: v.code,
            eeprom: v.eeprom.unwrap_or(0),
            iap: v.iap.unwrap_or(family.iap),
            rc_trim: family.rc_trim,
            mcs251: v.mcs251.unwrap_or(false),
            block: v.block.unwrap_or(family.block) as usize,
            erase_wait_secs: family.erase_wait_secs,
        }
    }

    pub fn find(&self, magic: u16) -> Result<McuModel> {
        for family in &self.families {
            if let Some(v) = family.variants.iter().find(|v| v.magic == magic) {
                log::debug!("magic 0x{:04X} found in family {}", magic, family.name);
                return Ok(Self::resolve(family, v));
            }
        }
        Err(Error::UnknownModel(magic))
    }
}

/// Convenience lookup against the embedded database.
pub fn find_model(magic: u16) -> Result<McuModel> {
    ModelDb::load()?.find(magic)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    String(String),
}

fn parse_number(raw: NumberOrString) -> std::result::Result<u32, String> {
    match raw {
        NumberOrString::Number(n) => Ok(n as u32),
        NumberOrString::String(s) => {
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u32::from_str_radix(hex, 16).map_err(|e| format!("{:?}: {}", s, e))
            } else if let Some(kb) = s
                .strip_suffix("KiB")
                .or_else(|| s.strip_suffix("KB"))
                .or_else(|| s.strip_suffix('K'))
            {
                kb.parse::<u32>()
                    .map(|n| n * 1024)
                    .map_err(|e| format!("{:?}: {}", s, e))
            } else {
                s.parse().map_err(|e| format!("{:?}: {}", s, e))
            }
        }
    }
}

fn parse_size<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = NumberOrString::deserialize(deserializer)?;
    parse_number(raw).map_err(serde::de::Error::custom)
}

fn parse_size_opt<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = NumberOrString::deserialize(deserializer)?;
    parse_number(raw).map(Some).map_err(serde::de::Error::custom)
}

fn parse_magic<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = NumberOrString::deserialize(deserializer)?;
    parse_number(raw)
        .map(|n| n as u16)
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_lookup() {
        let model = find_model(0xF449).unwrap();
        assert_eq!(model.name, "IAP15F2K61S2");
        assert_eq!(model.code, 61 * 1024);
        assert_eq!(model.block, 256);
        assert!(model.rc_trim);
        assert!(model.iap);
        assert!((model.code_kb() - 61.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_model_is_fatal() {
        assert!(matches!(find_model(0xDEAD), Err(Error::UnknownModel(0xDEAD))));
    }

    #[test]
    fn per_model_block_override() {
        let model = find_model(0xD17E).unwrap();
        assert_eq!(model.name, "STC12C5A60S2");
        assert_eq!(model.block, 256);
        let model = find_model(0xD301).unwrap();
        assert_eq!(model.block, 128);
    }

    #[test]
    fn database_invariants() {
        let db = ModelDb::load().unwrap();
        let mut magics = std::collections::HashSet::new();
        for family in &db.families {
            for v in &family.variants {
                let model = ModelDb::resolve(family, v);
                assert!(
                    model.code + model.eeprom <= model.total,
                    "{}: regions exceed total space",
                    model.name
                );
                assert!(
                    model.block == 64 || model.block == 128 || model.block == 256,
                    "{}: odd block size {}",
                    model.name,
                    model.block
                );
                assert!(magics.insert(model.magic), "duplicate magic {:04X}", model.magic);
            }
        }
    }
}
