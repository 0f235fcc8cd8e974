/// Who is being upgraded and to what. Fixed for the lifetime of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GearIdentity {
    pub uuid: String,
    pub namespace: String,
    pub target_version: String,
    pub hostname: String,
    pub ignore_cartridge_version: bool,
}
