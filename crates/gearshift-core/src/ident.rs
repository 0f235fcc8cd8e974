use std::fmt;

use anyhow::{anyhow, Result};

/// Identity of an installed cartridge as recorded in its `*_IDENT` marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartridgeIdent {
    pub vendor: String,
    pub name: String,
    pub version: String,
    pub cartridge_version: String,
}

impl CartridgeIdent {
    pub fn new(
        vendor: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        cartridge_version: impl Into<String>,
    ) -> Self {
        Self {
            vendor: vendor.into(),
            name: name.into(),
            version: version.into(),
            cartridge_version: cartridge_version.into(),
        }
    }

    /// Parses `<vendor>-<name>-<version>-<cartridge_version>`. The name may
    /// contain dashes; vendor is the first segment and the two versions are
    /// the last two.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let segments = trimmed.split('-').collect::<Vec<_>>();
        if segments.len() < 4 {
            return Err(anyhow!(
                "invalid cartridge ident '{trimmed}': expected <vendor>-<name>-<version>-<cartridge_version>"
            ));
        }
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(anyhow!(
                "invalid cartridge ident '{trimmed}': empty segment"
            ));
        }

        let last = segments.len() - 1;
        Ok(Self {
            vendor: segments[0].to_string(),
            name: segments[1..last - 1].join("-"),
            version: segments[last - 1].to_string(),
            cartridge_version: segments[last].to_string(),
        })
    }

    pub fn to_marker(&self) -> String {
        self.to_string()
    }

    pub fn cartridge_key(&self) -> String {
        crate::cartridge_key(&self.name, &self.version)
    }
}

impl fmt::Display for CartridgeIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.vendor, self.name, self.version, self.cartridge_version
        )
    }
}
