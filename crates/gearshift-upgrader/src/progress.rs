use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fs_utils::{current_unix_millis, write_atomic};
use crate::GearLayout;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub started_at_ms: u64,
    #[serde(default)]
    pub completed_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogLine {
    pub message: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProgressRecord {
    pub uuid: String,
    pub target_version: String,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub log: Vec<LogLine>,
    #[serde(default)]
    pub done_at_ms: Option<u64>,
}

/// Scratch space handed to a step body.
#[derive(Debug, Default)]
pub struct StepContext {
    values: BTreeMap<String, Value>,
    errors: Vec<String>,
}

impl StepContext {
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Records a soft error against the step without failing it.
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}

/// Resumable, persisted step log for one gear.
///
/// Every mutation is written to disk before the call returns, so a restarted
/// process observes exactly the steps that finished. Callers guarantee at most
/// one tracker per gear at a time.
#[derive(Debug)]
pub struct UpgradeProgress {
    path: PathBuf,
    record: ProgressRecord,
}

impl UpgradeProgress {
    /// Resumes the persisted log for `target_version`, or starts a new one if
    /// there is none, it belongs to another release, or it is already done.
    /// Nothing is written until the first mutation.
    pub fn open(layout: &GearLayout, uuid: &str, target_version: &str) -> Result<Self> {
        let path = layout.progress_path();
        let record = match read_progress_record(layout)? {
            Some(existing)
                if existing.done_at_ms.is_none() && existing.target_version == target_version =>
            {
                existing
            }
            _ => ProgressRecord {
                uuid: uuid.to_string(),
                target_version: target_version.to_string(),
                ..ProgressRecord::default()
            },
        };

        Ok(Self { path, record })
    }

    pub fn step<F>(&mut self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce(&mut Self, &mut StepContext) -> Result<()>,
    {
        if self.is_complete(name) {
            log::debug!("[{}] step {name} already complete", self.record.uuid);
            return Ok(());
        }

        let index = self.begin_step(name)?;
        let mut context = StepContext::default();
        let outcome = body(self, &mut context);

        let step = &mut self.record.steps[index];
        step.context = context.values;
        step.errors = context.errors;
        if outcome.is_ok() {
            step.status = StepStatus::Complete;
            step.completed_at_ms = Some(current_unix_millis());
        }
        self.persist()?;
        outcome
    }

    pub fn log(&mut self, message: impl Into<String>) -> Result<()> {
        self.log_with(message, std::iter::empty::<(&str, Value)>())
    }

    pub fn log_with<'k, I, V>(&mut self, message: impl Into<String>, attrs: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'k str, V)>,
        V: Into<Value>,
    {
        let message = message.into();
        log::info!("[{}] {message}", self.record.uuid);
        self.record.log.push(LogLine {
            message,
            attrs: attrs
                .into_iter()
                .map(|(key, value)| (key.to_string(), value.into()))
                .collect(),
            at_ms: current_unix_millis(),
        });
        self.persist()
    }

    pub fn is_complete(&self, name: &str) -> bool {
        self.record
            .steps
            .iter()
            .any(|step| step.name == name && step.status == StepStatus::Complete)
    }

    pub fn step_context(&self, name: &str) -> Option<&BTreeMap<String, Value>> {
        self.record
            .steps
            .iter()
            .find(|step| step.name == name)
            .map(|step| &step.context)
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.record.steps
    }

    pub fn done(&mut self) -> Result<()> {
        self.record.done_at_ms = Some(current_unix_millis());
        self.persist()
    }

    pub fn report(&self) -> String {
        render_report(&self.record)
    }

    fn begin_step(&mut self, name: &str) -> Result<usize> {
        let started_at_ms = current_unix_millis();
        let index = match self.record.steps.iter().position(|step| step.name == name) {
            Some(index) => {
                let step = &mut self.record.steps[index];
                step.started_at_ms = started_at_ms;
                step.context.clear();
                step.errors.clear();
                index
            }
            None => {
                self.record.steps.push(StepRecord {
                    name: name.to_string(),
                    status: StepStatus::Pending,
                    context: BTreeMap::new(),
                    errors: Vec::new(),
                    started_at_ms,
                    completed_at_ms: None,
                });
                self.record.steps.len() - 1
            }
        };
        self.persist()?;
        Ok(index)
    }

    fn persist(&self) -> Result<()> {
        let payload = serde_json::to_vec_pretty(&self.record)
            .context("failed to serialize upgrade progress")?;
        write_atomic(&self.path, &payload)
            .with_context(|| format!("failed to persist upgrade progress: {}", self.path.display()))
    }
}

pub fn read_progress_record(layout: &GearLayout) -> Result<Option<ProgressRecord>> {
    let path = layout.progress_path();
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read upgrade progress: {}", path.display()));
        }
    };

    let record = serde_json::from_slice(&raw)
        .with_context(|| format!("failed parsing upgrade progress: {}", path.display()))?;
    Ok(Some(record))
}

pub fn render_report(record: &ProgressRecord) -> String {
    let mut out = String::new();
    for line in &record.log {
        let _ = writeln!(out, "{}", line.message);
        for (key, value) in &line.attrs {
            let rendered = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            if rendered.contains('\n') {
                let _ = writeln!(out, "  {key}:");
                for text_line in rendered.lines() {
                    let _ = writeln!(out, "    {text_line}");
                }
            } else {
                let _ = writeln!(out, "  {key}: {rendered}");
            }
        }
    }
    out
}
