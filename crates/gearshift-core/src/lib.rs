mod gear;
mod ident;
mod itinerary;
mod manifest;
mod repository;

pub use gear::GearIdentity;
pub use ident::CartridgeIdent;
pub use itinerary::{cartridge_key, Itinerary, ItineraryEntry, UpgradeType};
pub use manifest::CartridgeManifest;
pub use repository::CartridgeRepository;

#[cfg(test)]
mod tests;
