use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub date: NaiveDate,
    pub count: u32,
}

pub type Ledger = BTreeMap<String, UsageRecord>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptLedgerPolicy {
    #[default]
    Reset,
    Fail,
}

impl std::str::FromStr for CorruptLedgerPolicy {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "reset" => Ok(Self::Reset),
            "fail" => Ok(Self::Fail),
            other => Err(anyhow!(
                "unsupported ledger corruption policy: {other}. expected reset or fail"
            )),
        }
    }
}

pub trait LedgerStore: Send + Sync {
    fn load(&self) -> Result<Ledger>;
    fn save(&self, ledger: &Ledger) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileLedgerStore {
    path: PathBuf,
    on_corrupt: CorruptLedgerPolicy,
}

impl FileLedgerStore {
    pub fn new(path: impl Into<PathBuf>, on_corrupt: CorruptLedgerPolicy) -> Self {
        Self {
            path: path.into(),
            on_corrupt,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerStore for FileLedgerStore {
    fn load(&self) -> Result<Ledger> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "usage ledger missing, creating an empty one");
                let ledger = Ledger::new();
                self.save(&ledger)?;
                return Ok(ledger);
            }
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("failed to read usage ledger {}", self.path.display())
                });
            }
        };

        match serde_json::from_str::<Ledger>(&raw) {
            Ok(ledger) => Ok(ledger),
            Err(error) => match self.on_corrupt {
                CorruptLedgerPolicy::Reset => {
                    warn!(
                        path = %self.path.display(),
                        error = %error,
                        "usage ledger is unreadable, continuing with an empty ledger"
                    );
                    Ok(Ledger::new())
                }
                CorruptLedgerPolicy::Fail => Err(error).with_context(|| {
                    format!("usage ledger {} is corrupt", self.path.display())
                }),
            },
        }
    }

    fn save(&self, ledger: &Ledger) -> Result<()> {
        write_json_atomic(&self.path, ledger)
            .with_context(|| format!("failed to write usage ledger {}", self.path.display()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    ledger: Mutex<Ledger>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ledger(ledger: Ledger) -> Self {
        Self {
            ledger: Mutex::new(ledger),
        }
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> Result<Ledger> {
        self.ledger
            .lock()
            .map(|ledger| ledger.clone())
            .map_err(|_| anyhow!("in-memory usage ledger lock poisoned"))
    }

    fn save(&self, ledger: &Ledger) -> Result<()> {
        let mut current = self
            .ledger
            .lock()
            .map_err(|_| anyhow!("in-memory usage ledger lock poisoned"))?;
        *current = ledger.clone();
        Ok(())
    }
}

/// Writes `value` to a uniquely named temp file in the target directory,
/// syncs it, then renames it over `path`. Readers see the old or the new
/// document, never a partial one, and concurrent writers never share a temp
/// file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;

    let body = serde_json::to_string_pretty(value).context("failed to serialize JSON")?;
    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    temp.write_all(body.as_bytes())
        .with_context(|| format!("failed to write {}", temp.path().display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync {}", temp.path().display()))?;
    temp.persist(path)
        .with_context(|| format!("failed to move temp file into place at {}", path.display()))?;

    Ok(())
}
