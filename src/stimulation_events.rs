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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::timebase::timestamp_seconds;

/// One stimulation as recorded from the stimulator notifications.
///
/// `time` is a Unix timestamp in seconds. `duration` stays `None` while the
/// stimulation is open-ended and is filled exactly once when it ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulationEvent {
    pub time: f64,
    pub duration: Option<f64>,
    pub amplitudes: Vec<f64>,
}

impl StimulationEvent {
    pub fn is_open(&self) -> bool {
        self.duration.is_none()
    }
}

/// Time-ordered stimulation history of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSeries {
    origin: DateTime<Utc>,
    events: Vec<StimulationEvent>,
}

impl EventSeries {
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            events: Vec::new(),
        }
    }

    pub(crate) fn from_parts(origin: DateTime<Utc>, events: Vec<StimulationEvent>) -> Result<Self> {
        if events.windows(2).any(|pair| pair[1].time < pair[0].time) {
            return Err(Error::malformed("stored stimulation events are not time-ordered"));
        }
        Ok(Self { origin, events })
    }

    pub fn origin(&self) -> DateTime<Utc> {
        self.origin
    }

    pub fn set_origin(&mut self, origin: DateTime<Utc>) {
        self.origin = origin;
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn has_data(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn events(&self) -> &[StimulationEvent] {
        &self.events
    }

    /// Records a stimulation start.
    ///
    /// `amplitudes` is copied, so later changes on the device never leak into the
    /// history. A still-open previous entry is closed at `time`. `None` amplitudes
    /// repeat the previous entry's channel configuration.
    pub fn add(&mut self, time: DateTime<Utc>, duration: Option<f64>, amplitudes: Option<&[f64]>) -> Result<()> {
        let time = timestamp_seconds(time);
        let amplitudes = match amplitudes {
            Some(amplitudes) => amplitudes.to_vec(),
            None => self
                .events
                .last()
                .map(|previous| previous.amplitudes.clone())
                .ok_or_else(|| Error::precondition("the first stimulation event must carry channel amplitudes"))?,
        };

        if let Some(previous) = self.events.last() {
            if time < previous.time {
                return Err(Error::malformed(format!(
                    "stimulation event at {time:.6} precedes previous event at {:.6}",
                    previous.time
                )));
            }
        }

        self.close_open(time);
        self.events.push(StimulationEvent {
            time,
            duration,
            amplitudes,
        });
        Ok(())
    }

    /// Fills the duration of the most recent open entry, if any.
    pub fn stop(&mut self, time: DateTime<Utc>) {
        self.close_open(timestamp_seconds(time));
    }

    fn close_open(&mut self, time: f64) {
        if let Some(last) = self.events.last_mut() {
            if last.is_open() {
                last.duration = Some((time - last.time).max(0.0));
            }
        }
    }

    /// Events whose start lies within `[t0, tf]`, both in seconds since the origin.
    pub fn events_between(&self, t0: f64, tf: f64) -> &[StimulationEvent] {
        let origin = timestamp_seconds(self.origin);
        let first = self.events.partition_point(|event| event.time - origin < t0);
        let last = self.events.partition_point(|event| event.time - origin <= tf);
        if first >= last {
            return &[];
        }
        &self.events[first..last]
    }

    /// Start times (seconds since the origin) of closed events.
    pub fn time(&self) -> Vec<f64> {
        let origin = timestamp_seconds(self.origin);
        self.closed().map(|event| event.time - origin).collect()
    }

    pub fn durations(&self) -> Vec<f64> {
        self.closed().filter_map(|event| event.duration).collect()
    }

    /// Amplitudes of closed events, one row per event.
    pub fn amplitudes(&self) -> Vec<Vec<f64>> {
        self.closed().map(|event| event.amplitudes.clone()).collect()
    }

    pub fn since(&self, first_event: usize) -> EventSeries {
        EventSeries {
            origin: self.origin,
            events: self.events.get(first_event..).map(<[_]>::to_vec).unwrap_or_default(),
        }
    }

    fn closed(&self) -> impl Iterator<Item = &StimulationEvent> {
        self.events.iter().filter(|event| !event.is_open())
    }
}

impl Default for EventSeries {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}
