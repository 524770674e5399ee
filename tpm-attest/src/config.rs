// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Agent-side configuration and the key hierarchy state file

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs_err as fs;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_human_bytes as hex_bytes;
use tpm_types::{Configuration, KeyHierarchyState};

use crate::anchor::AnchorSelection;
use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Trust anchor selector, see [`AnchorSelection`]
    pub tpm: String,
    #[serde(with = "hex_bytes")]
    pub endorsement_auth: Vec<u8>,
    pub dry_run: bool,
    pub state_file: PathBuf,
    /// Backend-supplied configuration last seen
    pub configuration: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tpm: "system".into(),
            endorsement_auth: Vec::new(),
            dry_run: false,
            state_file: "attest-state.json".into(),
            configuration: None,
        }
    }
}

fn deserialize_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        deserialize_json_file(path)
    }

    pub fn selection(&self) -> Result<AnchorSelection, Error> {
        Ok(self.tpm.parse()?)
    }

    /// The backend configuration file if one is set, else the defaults
    pub fn configuration(&self) -> Result<Configuration> {
        match &self.configuration {
            Some(path) => deserialize_json_file(path),
            None => Ok(Configuration::default()),
        }
    }

    /// `Ok(None)` before the first enrollment
    pub fn load_state(&self) -> Result<Option<KeyHierarchyState>> {
        if !self.state_file.exists() {
            return Ok(None);
        }
        deserialize_json_file(&self.state_file).map(Some)
    }

    pub fn save_state(&self, state: &KeyHierarchyState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state).context("failed to encode state")?;
        let tmp = self.state_file.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.state_file)?;
        Ok(())
    }
}
