use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, warn};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceStatus {
    Up,
    Down,
}

impl InterfaceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InterfaceStatus::Up => "up",
            InterfaceStatus::Down => "down",
        }
    }
}

impl fmt::Display for InterfaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterfaceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(InterfaceStatus::Up),
            "down" => Ok(InterfaceStatus::Down),
            other => Err(Error::StateCorruption(format!("invalid status '{other}'"))),
        }
    }
}

/// Interface name to last recorded status. Ordered so saved rows are stable.
pub type PersistedState = BTreeMap<String, InterfaceStatus>;

/// Transitions observed in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDelta {
    /// One formatted block per interface that went `up -> down`.
    pub new_failures: Vec<String>,
    /// Labels of interfaces that went `down -> up`.
    pub restored: Vec<String>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.new_failures.is_empty() && self.restored.is_empty()
    }
}

/// Flat `name,status` file, one row per interface, no header.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the previous cycle's state.
    ///
    /// A missing file and a malformed file both yield an empty state, so a
    /// corrupt file behaves exactly like a first run.
    pub fn load(&self) -> PersistedState {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {}, starting fresh", self.path.display());
                return PersistedState::new();
            }
            Err(e) => {
                warn!("Cannot read state file {}: {e}", self.path.display());
                return PersistedState::new();
            }
        };

        parse(&content).unwrap_or_else(|e| {
            warn!("Ignoring {}: {e}", self.path.display());
            PersistedState::new()
        })
    }

    /// Overwrites the file with `state`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the parent directory or file cannot be written.
    pub fn save(&self, state: &PersistedState) -> Result<(), Error> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, render(state))?;
        debug!("Saved {} interface states to {}", state.len(), self.path.display());
        Ok(())
    }
}

fn parse(content: &str) -> Result<PersistedState, Error> {
    let mut state = PersistedState::new();
    for (number, line) in content.lines().enumerate() {
        let fields: Vec<&str> = line.split(',').collect();
        let [name, status] = fields.as_slice() else {
            return Err(Error::StateCorruption(format!(
                "line {}: expected 2 fields, got {}",
                number + 1,
                fields.len()
            )));
        };
        state.insert((*name).to_string(), status.parse()?);
    }
    Ok(state)
}

fn render(state: &PersistedState) -> String {
    state
        .iter()
        .map(|(name, status)| format!("{name},{status}\n"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with(content: Option<&str>) -> (TempDir, StateStore) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("interface_states.csv");
        if let Some(content) = content {
            fs::write(&path, content).unwrap();
        }
        (dir, StateStore::new(path))
    }

    #[test]
    fn test_missing_file_is_empty() {
        let (_dir, store) = store_with(None);
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let (_dir, store) = store_with(None);
        let state = PersistedState::from([
            ("wlan0".to_string(), InterfaceStatus::Down),
            ("eth0".to_string(), InterfaceStatus::Up),
            ("wwan0".to_string(), InterfaceStatus::Up),
        ]);

        store.save(&state).unwrap();

        assert_eq!(store.load(), state);
        assert_eq!(
            fs::read_to_string(store.path()).unwrap(),
            "eth0,up\nwlan0,down\nwwan0,up\n"
        );
    }

    #[test]
    fn test_save_overwrites_previous_rows() {
        let (_dir, store) = store_with(Some("eth0,up\nppp0,down\n"));
        let state = PersistedState::from([("eth0".to_string(), InterfaceStatus::Down)]);

        store.save(&state).unwrap();

        assert_eq!(store.load(), state);
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("nested/dir/states.csv"));
        let state = PersistedState::from([("eth0".to_string(), InterfaceStatus::Up)]);

        store.save(&state).unwrap();

        assert_eq!(store.load(), state);
    }

    #[test]
    fn test_invalid_status_discards_everything() {
        let (_dir, store) = store_with(Some("eth0,up\nwlan0,unknown\n"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_wrong_field_count_discards_everything() {
        let (_dir, store) = store_with(Some("eth0,up\nwlan0\n"));
        assert!(store.load().is_empty());

        let (_dir, store) = store_with(Some("eth0,up,extra\nwlan0,down\n"));
        assert!(store.load().is_empty());

        let (_dir, store) = store_with(Some("eth0,up\n\nwlan0,down\n"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_crlf_rows_are_accepted() {
        let (_dir, store) = store_with(Some("eth0,up\r\nwlan0,down\r\n"));
        assert_eq!(store.load().len(), 2);
    }

    #[test]
    fn test_status_parsing_is_exact() {
        assert_eq!("up".parse::<InterfaceStatus>().unwrap(), InterfaceStatus::Up);
        assert!("UP".parse::<InterfaceStatus>().is_err());
        assert!(" down".parse::<InterfaceStatus>().is_err());
    }
}
