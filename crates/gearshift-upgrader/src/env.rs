use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};

use crate::GearLayout;

pub const GEAR_NAME_VAR: &str = "OPENSHIFT_GEAR_NAME";
pub const APP_NAME_VAR: &str = "OPENSHIFT_APP_NAME";
pub const APP_UUID_VAR: &str = "OPENSHIFT_APP_UUID";
pub const GEAR_DNS_VAR: &str = "OPENSHIFT_GEAR_DNS";
pub const PRIMARY_CARTRIDGE_DIR_VAR: &str = "OPENSHIFT_PRIMARY_CARTRIDGE_DIR";

pub const REQUIRED_GEAR_VARS: [&str; 2] = [GEAR_NAME_VAR, APP_NAME_VAR];

/// Builds the gear environment: every cartridge's `env/` directory first,
/// then the gear's `.env/`, then `.env/user_vars/`, later layers winning.
/// Each file is one variable named after the file.
pub fn load_gear_env(layout: &GearLayout) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    let gear_home = layout.gear_home();

    if gear_home.is_dir() {
        let mut cartridge_env_dirs = Vec::new();
        for entry in fs::read_dir(gear_home)
            .with_context(|| format!("failed to read gear home: {}", gear_home.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name == "app-root" || !entry.file_type()?.is_dir() {
                continue;
            }
            let env_dir = entry.path().join("env");
            if env_dir.is_dir() {
                cartridge_env_dirs.push(env_dir);
            }
        }
        cartridge_env_dirs.sort();

        for dir in cartridge_env_dirs {
            read_env_dir(&dir, &mut env)?;
        }
    }

    read_env_dir(&layout.env_dir(), &mut env)?;
    read_env_dir(&layout.user_env_dir(), &mut env)?;
    Ok(env)
}

pub fn missing_required_vars(env: &BTreeMap<String, String>) -> Vec<&'static str> {
    REQUIRED_GEAR_VARS
        .iter()
        .copied()
        .filter(|key| !env.contains_key(*key))
        .collect()
}

fn read_env_dir(dir: &Path, env: &mut BTreeMap<String, String>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read env directory: {}", dir.display()));
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    for path in files {
        let Some(key) = path.file_name().map(|name| name.to_string_lossy().to_string()) else {
            continue;
        };
        if !is_env_key(&key) {
            continue;
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read env file: {}", path.display()))?;
        env.insert(key, parse_env_value(&raw));
    }
    Ok(())
}

/// Accepts both a bare value and the legacy `export KEY='value'` form.
fn parse_env_value(raw: &str) -> String {
    let value = raw.trim_end_matches(['\n', '\r']);
    let Some(assignment) = value.strip_prefix("export ") else {
        return value.to_string();
    };
    let Some((_, rhs)) = assignment.split_once('=') else {
        return value.to_string();
    };

    let rhs = rhs.trim();
    for quote in ['\'', '"'] {
        if rhs.len() >= 2 && rhs.starts_with(quote) && rhs.ends_with(quote) {
            return rhs[1..rhs.len() - 1].to_string();
        }
    }
    rhs.to_string()
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}
