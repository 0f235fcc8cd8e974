use super::*;

const PHP_MANIFEST: &str = r#"
name = "php"
vendor = "redhat"
version = "5.4"
cartridge_version = "0.0.12"
short_name = "PHP"
versions = ["5.3", "5.4"]
compatible_versions = ["0.0.10", "0.0.11"]
processed_templates = ["conf/php.ini", "conf.d/openshift.conf"]
setup_rewritten = ["conf/", "logs/setup.log"]
"#;

#[test]
fn parse_manifest() {
    let parsed = CartridgeManifest::from_toml_str(PHP_MANIFEST).expect("manifest should parse");
    assert_eq!(parsed.name, "php");
    assert_eq!(parsed.vendor, "redhat");
    assert_eq!(parsed.cartridge_version.to_string(), "0.0.12");
    assert_eq!(parsed.directory, "php", "directory defaults to short_name");
    assert!(parsed.supports_version("5.3"));
    assert!(!parsed.supports_version("5.5"));
    assert!(parsed.is_compatible_with("0.0.11"));
    assert!(!parsed.is_compatible_with("0.0.9"));
    assert!(parsed.is_latest("0.0.12"));
    assert_eq!(parsed.cartridge_key(), "php-5.4");
    assert_eq!(parsed.setup_rewritten, vec!["conf/", "logs/setup.log"]);
}

#[test]
fn parse_manifest_accepts_cartridge_vendor_alias() {
    let content = r#"
name = "mock"
cartridge_vendor = "redhat"
version = "0.1"
cartridge_version = "0.0.2"
short_name = "MOCK"
directory = "mock-dir"
versions = ["0.1"]
"#;

    let parsed = CartridgeManifest::from_toml_str(content).expect("manifest should parse");
    assert_eq!(parsed.vendor, "redhat");
    assert_eq!(parsed.directory, "mock-dir");
    assert_eq!(
        parsed.versions.iter().cloned().collect::<Vec<_>>(),
        vec!["0.1"]
    );
    assert!(parsed.compatible_versions.is_empty());
}

#[test]
fn parse_manifest_rejects_missing_versions() {
    let content = r#"
name = "mock"
vendor = "redhat"
version = "0.1"
cartridge_version = "0.0.2"
short_name = "MOCK"
"#;

    let err = CartridgeManifest::from_toml_str(content).expect_err("missing versions must fail");
    assert!(
        err.to_string().contains("at least one supported version"),
        "unexpected error: {err}"
    );

    let empty = format!("{content}versions = []\n");
    assert!(CartridgeManifest::from_toml_str(&empty).is_err());
}

#[test]
fn parse_manifest_rejects_empty_name() {
    let content = r#"
name = " "
vendor = "redhat"
version = "0.1"
cartridge_version = "0.0.2"
short_name = "MOCK"
"#;

    let err = CartridgeManifest::from_toml_str(content).expect_err("empty name must fail");
    assert!(
        err.to_string().contains("'name' must not be empty"),
        "unexpected error: {err}"
    );
}

#[test]
fn parse_manifest_rejects_dash_in_version() {
    let content = r#"
name = "mock"
vendor = "redhat"
version = "0.1-beta"
cartridge_version = "0.0.2"
short_name = "MOCK"
"#;

    assert!(CartridgeManifest::from_toml_str(content).is_err());
}

#[test]
fn parse_manifest_rejects_escaping_setup_paths() {
    let content = r#"
name = "mock"
vendor = "redhat"
version = "0.1"
cartridge_version = "0.0.2"
short_name = "MOCK"
setup_rewritten = ["../other/conf"]
"#;

    let err = CartridgeManifest::from_toml_str(content).expect_err("escaping path must fail");
    assert!(
        format!("{err:#}").contains("must not escape"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn parse_manifest_rejects_non_semver_cartridge_version() {
    let content = r#"
name = "mock"
vendor = "redhat"
version = "0.1"
cartridge_version = "2"
short_name = "MOCK"
"#;

    assert!(CartridgeManifest::from_toml_str(content).is_err());
}

#[test]
fn ident_parse_simple() {
    let ident = CartridgeIdent::parse("redhat-php-5.4-0.0.11\n").expect("must parse");
    assert_eq!(ident.vendor, "redhat");
    assert_eq!(ident.name, "php");
    assert_eq!(ident.version, "5.4");
    assert_eq!(ident.cartridge_version, "0.0.11");
    assert_eq!(ident.cartridge_key(), "php-5.4");
}

#[test]
fn ident_parse_keeps_dashes_in_name() {
    let ident = CartridgeIdent::parse("redhat-jboss-as-7-0.0.5").expect("must parse");
    assert_eq!(ident.name, "jboss-as");
    assert_eq!(ident.version, "7");
    assert_eq!(ident.cartridge_version, "0.0.5");
    assert_eq!(ident.to_marker(), "redhat-jboss-as-7-0.0.5");
}

#[test]
fn ident_parse_rejects_short_or_empty_segments() {
    assert!(CartridgeIdent::parse("redhat-php-5.4").is_err());
    assert!(CartridgeIdent::parse("redhat--5.4-0.0.1").is_err());
    assert!(CartridgeIdent::parse("").is_err());
}

#[test]
fn manifest_ident_uses_latest_cartridge_version() {
    let manifest = CartridgeManifest::from_toml_str(PHP_MANIFEST).expect("manifest should parse");
    assert_eq!(manifest.ident().to_string(), "redhat-php-5.4-0.0.12");
}

#[test]
fn itinerary_tracks_incompatible_entries() {
    let mut itinerary = Itinerary::default();
    assert!(itinerary.is_empty());
    assert!(!itinerary.has_incompatible_upgrade());

    itinerary.create_entry("php-5.4", UpgradeType::Compatible);
    assert!(!itinerary.has_incompatible_upgrade());

    itinerary.create_entry("mysql-5.1", UpgradeType::Incompatible);
    assert!(itinerary.has_incompatible_upgrade());
    assert!(!itinerary.is_empty());
    assert_eq!(itinerary.entries[1].cartridge, "mysql-5.1");
}

#[test]
fn upgrade_type_serializes_in_upper_case() {
    let entry = ItineraryEntry {
        cartridge: "php-5.4".to_string(),
        upgrade_type: UpgradeType::Compatible,
    };
    let rendered = toml::to_string(&entry).expect("must serialize");
    assert!(rendered.contains("upgrade_type = \"COMPATIBLE\""), "{rendered}");
}
