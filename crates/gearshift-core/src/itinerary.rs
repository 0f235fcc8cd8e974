use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpgradeType {
    Compatible,
    Incompatible,
}

impl UpgradeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compatible => "compatible",
            Self::Incompatible => "incompatible",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItineraryEntry {
    pub cartridge: String,
    pub upgrade_type: UpgradeType,
}

/// Ordered upgrade plan for one gear.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Itinerary {
    #[serde(default)]
    pub entries: Vec<ItineraryEntry>,
}

impl Itinerary {
    pub fn create_entry(&mut self, cartridge: impl Into<String>, upgrade_type: UpgradeType) {
        self.entries.push(ItineraryEntry {
            cartridge: cartridge.into(),
            upgrade_type,
        });
    }

    pub fn has_incompatible_upgrade(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.upgrade_type == UpgradeType::Incompatible)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn cartridge_key(name: &str, version: &str) -> String {
    format!("{name}-{version}")
}
