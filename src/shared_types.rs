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

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Leg side a gait-phase estimate or a stimulation template refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
    Both,
}

impl Side {
    /// Protocol encoding: 0 left, 1 right, 2 both
    pub fn from_index(index: i64) -> Result<Self> {
        match index {
            0 => Ok(Side::Left),
            1 => Ok(Side::Right),
            2 => Ok(Side::Both),
            other => Err(Error::malformed(format!(
                "side must be 0 (left), 1 (right) or 2 (both), got {other}"
            ))),
        }
    }

    pub fn legs(self) -> &'static [Side] {
        match self {
            Side::Left => &[Side::Left],
            Side::Right => &[Side::Right],
            Side::Both => &[Side::Left, Side::Right],
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
            Side::Both => write!(f, "both"),
        }
    }
}

/// Canonical gait landmarks, expressed as stride percentage [0; 1]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaitEvent {
    #[serde(rename = "heel_strike_0")]
    HeelStrike0,
    ToeOff,
    #[serde(rename = "heel_strike_100")]
    HeelStrike100,
}

impl GaitEvent {
    pub fn stride_percentage(self) -> f64 {
        match self {
            GaitEvent::HeelStrike0 => 0.0,
            GaitEvent::ToeOff => 0.6,
            GaitEvent::HeelStrike100 => 1.0,
        }
    }
}

/// Device parameter value: either broadcast to every channel or given per channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue<T> {
    Broadcast(T),
    PerChannel(Vec<T>),
}

impl<T: Clone> ParamValue<T> {
    /// Expands the value to exactly `channel_count` entries.
    pub fn expand(&self, channel_count: usize) -> Result<Vec<T>> {
        match self {
            ParamValue::Broadcast(value) => Ok(vec![value.clone(); channel_count]),
            ParamValue::PerChannel(values) if values.len() == channel_count => Ok(values.clone()),
            ParamValue::PerChannel(values) => Err(Error::malformed(format!(
                "expected {} channel values, got {}",
                channel_count,
                values.len()
            ))),
        }
    }
}

/// Top-level runner states. Stimulating is an orthogonal flag, see [`RunnerStatus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    #[default]
    Disconnected,
    Connected,
    Recording,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub state: RunnerState,
    pub stimulating: bool,
}

/// Pushed to clients on connect so they can size their buffers and align clocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(rename = "t0")]
    pub origin_timestamp: f64,
    #[serde(rename = "nidaqNbChannels")]
    pub acquisition_channels: usize,
    #[serde(rename = "rehastimNbChannels")]
    pub stimulation_channels: usize,
    pub frame_rate: f64,
}

/// Scheduler loop counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub cycles: u64,
    pub evaluated_cycles: u64,
    pub rule_failures: u64,
    pub amplitude_commands: u64,
    pub device_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_state_defaults_to_disconnected() {
        assert_eq!(RunnerState::default(), RunnerState::Disconnected);
        assert_eq!(RunnerStatus::default().state, RunnerState::Disconnected);
    }

    #[test]
    fn test_device_info_wire_names() {
        let info = DeviceInfo {
            origin_timestamp: 12.5,
            acquisition_channels: 1,
            stimulation_channels: 8,
            frame_rate: 1000.0,
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["t0"], 12.5);
        assert_eq!(value["nidaqNbChannels"], 1);
        assert_eq!(value["rehastimNbChannels"], 8);
        assert_eq!(value["frameRate"], 1000.0);
    }

    #[test]
    fn test_side_from_protocol_index() {
        assert_eq!(Side::from_index(0).unwrap(), Side::Left);
        assert_eq!(Side::from_index(2).unwrap(), Side::Both);
        assert!(matches!(Side::from_index(3), Err(Error::MalformedInput(_))));
        assert_eq!(Side::Both.legs(), &[Side::Left, Side::Right]);
    }

    #[test]
    fn test_param_value_expansion() {
        assert_eq!(ParamValue::Broadcast(2.0).expand(3).unwrap(), vec![2.0, 2.0, 2.0]);
        assert_eq!(ParamValue::PerChannel(vec![1, 2]).expand(2).unwrap(), vec![1, 2]);
        assert!(ParamValue::PerChannel(vec![1, 2]).expand(3).is_err());
    }

    #[test]
    fn test_gait_event_names() {
        let event: GaitEvent = serde_json::from_str("\"toe_off\"").unwrap();
        assert_eq!(event.stride_percentage(), 0.6);
        let event: GaitEvent = serde_json::from_str("\"heel_strike_100\"").unwrap();
        assert_eq!(event, GaitEvent::HeelStrike100);
    }
}
