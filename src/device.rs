//! AVR part catalog: alias to device signature and flash size.
use serde::Deserialize;

use crate::error::{Error, Result};

/// One catalog entry as stored in `devices/avr.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Part {
    pub name: String,
    #[serde(deserialize_with = "parse_signature")]
    pub signature: [u8; 3],
    #[serde(deserialize_with = "parse_flash_size")]
    pub flash_size: u32,
    aliases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    parts: Vec<Part>,
}

impl Catalog {
    pub fn load() -> Result<Self> {
        serde_yaml::from_str(include_str!("../devices/avr.yaml"))
            .map_err(|e| Error::Config(format!("invalid device catalog: {e}")))
    }

    /// Case-insensitive alias lookup (`m328p`, `mega328p`, `atmega328p`).
    pub fn find(&self, alias: &str) -> Option<&Part> {
        let alias = alias.to_ascii_lowercase();
        self.parts.iter().find(|p| p.aliases.contains(&alias))
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }
}

/// The device a session talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub signature: [u8; 3],
    pub flash_size: u32,
}

impl Device {
    /// Resolve a part-number alias. Unknown aliases yield a zeroed device;
    /// callers should treat that as a configuration error before starting a
    /// session, since no signature will ever match it.
    pub fn resolve(alias: &str) -> Result<Device> {
        let catalog = Catalog::load()?;
        Ok(match catalog.find(alias) {
            Some(part) => Device {
                name: part.name.clone(),
                signature: part.signature,
                flash_size: part.flash_size,
            },
            None => Device {
                name: alias.to_string(),
                signature: [0; 3],
                flash_size: 0,
            },
        })
    }

    pub fn is_known(&self) -> bool {
        self.signature != [0; 3] && self.flash_size != 0
    }
}

impl ::std::fmt::Display for Device {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(
            f,
            "{} (signature {}, flash {} KiB)",
            self.name,
            hex::encode_upper(self.signature),
            self.flash_size / 1024,
        )
    }
}

fn parse_signature<'de, D>(deserializer: D) -> std::result::Result<[u8; 3], D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    let compact: String = s.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = hex::decode(&compact)
        .map_err(|e| serde::de::Error::custom(format!("bad signature {s:?}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| serde::de::Error::custom(format!("signature {s:?} is not 3 bytes")))
}

fn parse_flash_size<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    let parsed = if let Some(hexpart) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hexpart, 16).ok()
    } else if let Some(kib) = s
        .strip_suffix("KiB")
        .or_else(|| s.strip_suffix("KB"))
        .or_else(|| s.strip_suffix('K'))
    {
        kib.parse::<u32>().ok().map(|v| v * 1024)
    } else {
        s.parse().ok()
    };
    parsed.ok_or_else(|| serde::de::Error::custom(format!("cannot parse flash size {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_loads() {
        let catalog = Catalog::load().unwrap();
        assert!(catalog.parts().len() >= 10);
        for part in catalog.parts() {
            assert_ne!(part.signature, [0; 3], "{}", part.name);
            assert!(part.flash_size >= 8 * 1024, "{}", part.name);
            assert_eq!(part.aliases.len(), 3, "{}", part.name);
        }
    }

    #[test]
    fn alias_forms_resolve_to_same_part() {
        for alias in ["m328p", "mega328p", "atmega328p", "M328P", "ATmega328P"] {
            let device = Device::resolve(alias).unwrap();
            assert_eq!(device.name, "ATmega328P");
            assert_eq!(device.signature, [0x1E, 0x95, 0x0F]);
            assert_eq!(device.flash_size, 32 * 1024);
            assert!(device.is_known());
        }
    }

    #[test]
    fn p_and_non_p_parts_differ() {
        let m328 = Device::resolve("m328").unwrap();
        let m328p = Device::resolve("m328p").unwrap();
        assert_ne!(m328.signature, m328p.signature);
        assert_eq!(m328.flash_size, m328p.flash_size);
    }

    #[test]
    fn unknown_alias_resolves_to_zeroed_device() {
        let device = Device::resolve("z80").unwrap();
        assert_eq!(device.signature, [0; 3]);
        assert_eq!(device.flash_size, 0);
        assert!(!device.is_known());
    }
}
