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

//! Session aggregate and the persisted trial format.
//!
//! A [`Session`] pairs the kinematic [`TimeSeries`] and the stimulation
//! [`EventSeries`] under one origin instant. Trials are written either as the
//! JSON-safe [`SessionSnapshot`] (plain lists) or as `bincode` of the native
//! structure, picked by file extension.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::stimulation_events::{EventSeries, StimulationEvent};
use crate::timebase::{from_timestamp_seconds, timestamp_seconds, SampleBlock, TimeSeries};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    kinematics: TimeSeries,
    stimulation: EventSeries,
}

/// Position of an incremental reader in a growing session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCursor {
    pub blocks: usize,
    pub events: usize,
}

impl Session {
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            kinematics: TimeSeries::new(origin),
            stimulation: EventSeries::new(origin),
        }
    }

    pub fn origin(&self) -> DateTime<Utc> {
        self.kinematics.origin()
    }

    /// Moves both streams to a new origin in one step.
    pub fn set_origin(&mut self, origin: DateTime<Utc>) {
        self.kinematics.set_origin(origin);
        self.stimulation.set_origin(origin);
    }

    pub fn kinematics(&self) -> &TimeSeries {
        &self.kinematics
    }

    pub fn kinematics_mut(&mut self) -> &mut TimeSeries {
        &mut self.kinematics
    }

    pub fn stimulation(&self) -> &EventSeries {
        &self.stimulation
    }

    pub fn stimulation_mut(&mut self) -> &mut EventSeries {
        &mut self.stimulation
    }

    pub fn has_data(&self) -> bool {
        self.kinematics.has_data() || self.stimulation.has_data()
    }

    pub fn end_cursor(&self) -> SessionCursor {
        SessionCursor {
            blocks: self.kinematics.len(),
            events: self.stimulation.len(),
        }
    }

    /// Everything appended at or after `cursor`.
    pub fn since(&self, cursor: SessionCursor) -> Session {
        Session {
            kinematics: self.kinematics.since(cursor.blocks),
            stimulation: self.stimulation.since(cursor.events),
        }
    }

    pub fn to_snapshot(&self) -> SessionSnapshot {
        let blocks = self.kinematics.blocks();
        SessionSnapshot {
            origin_timestamp: timestamp_seconds(self.origin()),
            kinematic_series: KinematicSnapshot {
                start_offset: self.kinematics.start_offset(),
                time_blocks: blocks.iter().map(|block| block.time().to_vec()).collect(),
                data_blocks: blocks.iter().map(SampleBlock::rows).collect(),
            },
            stimulation_series: StimulationSnapshot {
                events: self
                    .stimulation
                    .events()
                    .iter()
                    .map(|event| (event.time, event.duration, event.amplitudes.clone()))
                    .collect(),
            },
        }
    }

    pub fn from_snapshot(snapshot: SessionSnapshot) -> Result<Self> {
        let origin = from_timestamp_seconds(snapshot.origin_timestamp)?;
        let kinematic = snapshot.kinematic_series;
        if kinematic.time_blocks.len() != kinematic.data_blocks.len() {
            return Err(Error::malformed(format!(
                "{} time blocks but {} data blocks",
                kinematic.time_blocks.len(),
                kinematic.data_blocks.len()
            )));
        }

        let blocks = kinematic
            .time_blocks
            .into_iter()
            .zip(kinematic.data_blocks.iter())
            .map(|(time, rows)| SampleBlock::from_rows(time, rows))
            .collect::<Result<Vec<_>>>()?;

        let events = snapshot
            .stimulation_series
            .events
            .into_iter()
            .map(|(time, duration, amplitudes)| StimulationEvent {
                time,
                duration,
                amplitudes,
            })
            .collect();

        Ok(Session {
            kinematics: TimeSeries::from_parts(origin, kinematic.start_offset, blocks)?,
            stimulation: EventSeries::from_parts(origin, events)?,
        })
    }

    pub fn to_binary(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_binary(bytes: &[u8]) -> Result<Self> {
        let session: Session = bincode::deserialize(bytes)?;
        // Re-run the store invariants on whatever came from disk
        let origin = session.origin();
        Ok(Session {
            kinematics: TimeSeries::from_parts(
                origin,
                session.kinematics.start_offset(),
                session.kinematics.blocks().to_vec(),
            )?,
            stimulation: EventSeries::from_parts(origin, session.stimulation.events().to_vec())?,
        })
    }

    /// Writes the session; `.json` paths get the JSON-safe variant, anything else binary.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        if is_json_path(path) {
            serde_json::to_writer(&mut writer, &self.to_snapshot())?;
        } else {
            writer.write_all(&self.to_binary()?)?;
        }
        writer.flush()?;

        info!(
            "Saved session to {:?}: {} blocks, {} stimulation events",
            path,
            self.kinematics.len(),
            self.stimulation.len()
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if is_json_path(path) {
            let snapshot: SessionSnapshot = serde_json::from_reader(BufReader::new(File::open(path)?))?;
            Self::from_snapshot(snapshot)
        } else {
            Self::from_binary(&std::fs::read(path)?)
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

fn is_json_path(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"))
}

/// JSON-safe persisted form of a [`Session`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub origin_timestamp: f64,
    pub kinematic_series: KinematicSnapshot,
    pub stimulation_series: StimulationSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KinematicSnapshot {
    pub start_offset: Option<f64>,
    pub time_blocks: Vec<Vec<f64>>,
    /// `data_blocks[block][channel][sample]`
    pub data_blocks: Vec<Vec<Vec<f64>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulationSnapshot {
    /// `(time, duration or null, channel amplitudes)`
    pub events: Vec<(f64, Option<f64>, Vec<f64>)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use nalgebra::DMatrix;

    fn recorded_session() -> Session {
        let origin = Utc::now();
        let mut session = Session::new(origin);
        for index in 0..3 {
            let time: Vec<f64> = (0..5).map(|i| (index * 5 + i) as f64 * 0.01).collect();
            let data = DMatrix::from_fn(2, 5, |channel, i| (channel * 10 + i) as f64 * 0.5);
            session
                .kinematics_mut()
                .add_block_at(origin + Duration::milliseconds(20), SampleBlock::new(time, data).unwrap())
                .unwrap();
        }
        session
            .stimulation_mut()
            .add(origin + Duration::milliseconds(30), Some(0.1), Some(&[10.0, 0.0, 5.0]))
            .unwrap();
        session
            .stimulation_mut()
            .add(origin + Duration::milliseconds(200), None, Some(&[0.0, 0.0, 5.0]))
            .unwrap();
        session
    }

    fn assert_equivalent(a: &Session, b: &Session) {
        assert!(crate::timebase::seconds_between(a.origin(), b.origin()).abs() < 1e-3);
        assert_eq!(a.kinematics().start_offset(), b.kinematics().start_offset());
        assert_eq!(a.kinematics().time(), b.kinematics().time());
        assert_eq!(a.kinematics().as_array(), b.kinematics().as_array());
        assert_eq!(a.stimulation().events(), b.stimulation().events());
    }

    #[test]
    fn test_set_origin_propagates_to_both_streams() {
        let mut session = Session::default();
        let origin = Utc::now() + Duration::seconds(10);
        session.set_origin(origin);
        assert_eq!(session.kinematics().origin(), origin);
        assert_eq!(session.stimulation().origin(), origin);
    }

    #[test]
    fn test_json_snapshot_round_trip() {
        let session = recorded_session();
        let text = serde_json::to_string(&session.to_snapshot()).unwrap();
        assert!(text.contains("originTimestamp"));
        assert!(text.contains("kinematicSeries"));

        let restored = Session::from_snapshot(serde_json::from_str(&text).unwrap()).unwrap();
        assert_equivalent(&session, &restored);
    }

    #[test]
    fn test_json_snapshot_keeps_every_float_bit() {
        let origin = Utc::now();
        let mut session = Session::new(origin);
        let time: Vec<f64> = (0..40).map(|i| i as f64 * 0.0123456789 + 1.0 / 3.0).collect();
        let data = DMatrix::from_fn(3, 40, |channel, i| ((channel * 40 + i) as f64 * 0.7).sin() / 7.0);
        session
            .kinematics_mut()
            .add_block_at(origin + Duration::nanoseconds(123_456_789), SampleBlock::new(time, data).unwrap())
            .unwrap();
        session
            .stimulation_mut()
            .add(
                origin + Duration::nanoseconds(987_654_321),
                Some(2.0 / 3.0),
                Some(&[0.1 + 0.2, 1.0 / 7.0]),
            )
            .unwrap();

        let text = serde_json::to_string(&session.to_snapshot()).unwrap();
        let restored = Session::from_snapshot(serde_json::from_str(&text).unwrap()).unwrap();
        assert_equivalent(&session, &restored);
        assert_eq!(session.stimulation().amplitudes(), restored.stimulation().amplitudes());
        assert_eq!(session.stimulation().time(), restored.stimulation().time());
    }

    #[test]
    fn test_save_and_load_by_extension() {
        let session = recorded_session();
        let dir = tempfile::tempdir().unwrap();

        for name in ["trial.json", "trial.bin"] {
            let path = dir.path().join(name);
            session.save(&path).unwrap();
            let restored = Session::load(&path).unwrap();
            assert_equivalent(&session, &restored);
        }

        let json = std::fs::read(dir.path().join("trial.json")).unwrap();
        assert_eq!(json.first(), Some(&b'{'));
    }

    #[test]
    fn test_snapshot_with_mismatched_blocks_is_rejected() {
        let mut snapshot = recorded_session().to_snapshot();
        snapshot.kinematic_series.data_blocks.pop();
        assert!(matches!(Session::from_snapshot(snapshot), Err(Error::MalformedInput(_))));
    }

    #[test]
    fn test_since_cursor() {
        let session = recorded_session();
        let cursor = session.end_cursor();
        assert!(!session.since(cursor).has_data());
        assert_eq!(session.since(SessionCursor::default()), session);
    }
}
