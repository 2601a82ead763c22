////////////////////////////////////////////////////////////////////////////////
//                                                                            //
//  Copyright (c) 2025 Leonardo Consoni                                       //
//                                                                            //
//  This file is part of Stimwalker.                                          //
//                                                                            //
//  Stimwalker is free software: you can redistribute it and/or modify        //
//  it under the terms of the GNU Lesser General Public License as published  //
//  by the Free Software Foundation, either version 3 of the License, or      //
//  (at your option) any later version.                                       //
//                                                                            //
//  Stimwalker is distributed in the hope that it will be useful,             //
//  but WITHOUT ANY WARRANTY; without even the implied warranty of            //
//  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the              //
//  GNU Lesser General Public License for more details.                       //
//                                                                            //
//  You should have received a copy of the GNU Lesser General Public License  //
//  along with Stimwalker. If not, see <http://www.gnu.org/licenses/>.        //
//                                                                            //
////////////////////////////////////////////////////////////////////////////////

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub command_port: u16,
    pub data_port: u16,
    /// First retry delay after a failed bind, doubled on each failure
    pub bind_retry_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            command_port: 4042,
            data_port: 4043,
            bind_retry_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub channels: usize,
    /// Hz
    pub frame_rate: f64,
    /// Seconds of samples per delivered block
    pub block_duration: f64,
}

impl AcquisitionConfig {
    pub fn samples_per_block(&self) -> usize {
        ((self.frame_rate * self.block_duration).round() as usize).max(1)
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            frame_rate: 1000.0,
            block_duration: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulatorConfig {
    pub channels: usize,
    /// mA, used by manual stimulation and the built-in templates
    pub amplitude: f64,
    /// µs
    pub pulse_width: f64,
    /// ms
    pub pulse_interval: f64,
    /// mA
    pub max_amplitude: f64,
}

impl Default for StimulatorConfig {
    fn default() -> Self {
        Self {
            channels: 8,
            amplitude: 50.0,
            pulse_width: 100.0,
            pulse_interval: 25.0,
            max_amplitude: 130.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub server: ServerConfig,
    pub acquisition: AcquisitionConfig,
    pub stimulator: StimulatorConfig,
    /// Declarative rule descriptions, relative to the root directory
    pub rules_file: Option<PathBuf>,
    /// Where relative trial filenames are saved
    pub trials_dir: PathBuf,
}

impl SystemConfig {
    pub fn load(root_dir: &Path) -> Result<Self> {
        let config_path = root_dir.join("config/system.json");
        if !config_path.exists() {
            warn!("No system configuration at {:?}, using defaults", config_path);
            return Ok(Self::default().rooted(root_dir));
        }

        let config_file = File::open(&config_path)
            .with_context(|| format!("Failed to open {:?}", config_path))?;
        let config: SystemConfig = serde_json::from_reader(BufReader::new(config_file))
            .with_context(|| format!("Failed to parse {:?}", config_path))?;
        config.validate()?;

        info!("System configuration loaded from {:?}", config_path);
        Ok(config.rooted(root_dir))
    }

    fn validate(&self) -> Result<()> {
        if self.acquisition.frame_rate <= 0.0 || self.acquisition.block_duration <= 0.0 {
            anyhow::bail!("Acquisition frame rate and block duration must be positive");
        }
        if self.stimulator.channels == 0 {
            anyhow::bail!("Stimulator needs at least one channel");
        }
        if self.stimulator.amplitude > self.stimulator.max_amplitude {
            anyhow::bail!(
                "Default amplitude {} exceeds maximum {}",
                self.stimulator.amplitude,
                self.stimulator.max_amplitude
            );
        }
        Ok(())
    }

    /// Resolves relative paths against the root directory.
    fn rooted(mut self, root_dir: &Path) -> Self {
        self.rules_file = self.rules_file.map(|path| root_dir.join(path));
        self.trials_dir = root_dir.join(&self.trials_dir);
        self
    }
}
