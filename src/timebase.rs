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

//! Kinematic sample store anchored to a session origin instant.
//!
//! Device blocks arrive with a device-relative time vector. The first block
//! received by a [`TimeSeries`] freezes its start offset, the latency between the
//! origin instant and that first sample; every stored time is shifted by it so
//! that stored times are seconds since the origin and can be compared with the
//! stimulation events of the same session.

use std::borrow::Cow;
use std::ops::Range;

use chrono::{DateTime, Utc};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Seconds elapsed from `from` to `to` (negative if `to` is earlier).
pub fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_nanoseconds() {
        Some(nanos) => nanos as f64 / 1e9,
        None => delta.num_milliseconds() as f64 / 1e3,
    }
}

/// Unix timestamp in seconds with sub-second precision.
pub fn timestamp_seconds(instant: DateTime<Utc>) -> f64 {
    instant.timestamp() as f64 + f64::from(instant.timestamp_subsec_nanos()) / 1e9
}

pub fn from_timestamp_seconds(timestamp: f64) -> Result<DateTime<Utc>> {
    if !timestamp.is_finite() {
        return Err(Error::malformed(format!("invalid timestamp {timestamp}")));
    }
    let seconds = timestamp.floor();
    let nanos = ((timestamp - seconds) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::<Utc>::from_timestamp(seconds as i64, nanos)
        .ok_or_else(|| Error::malformed(format!("timestamp {timestamp} is out of range")))
}

/// One block of samples: an ascending time vector and one data row per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBlock {
    time: Vec<f64>,
    data: DMatrix<f64>,
}

impl SampleBlock {
    pub fn new(time: Vec<f64>, data: DMatrix<f64>) -> Result<Self> {
        if time.is_empty() {
            return Err(Error::malformed("sample block has no samples"));
        }
        if data.ncols() != time.len() {
            return Err(Error::malformed(format!(
                "sample block has {} time stamps but {} samples per channel",
                time.len(),
                data.ncols()
            )));
        }
        if time.windows(2).any(|pair| !(pair[1] > pair[0])) {
            return Err(Error::malformed("sample block time vector is not ascending"));
        }
        Ok(Self { time, data })
    }

    /// Builds a block from channel rows (`rows[channel][sample]`).
    pub fn from_rows(time: Vec<f64>, rows: &[Vec<f64>]) -> Result<Self> {
        let width = time.len();
        if rows.iter().any(|row| row.len() != width) {
            return Err(Error::malformed("channel rows do not match the time vector length"));
        }
        let data = DMatrix::from_fn(rows.len(), width, |channel, sample| rows[channel][sample]);
        Self::new(time, data)
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn data(&self) -> &DMatrix<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.data
    }

    pub fn width(&self) -> usize {
        self.time.len()
    }

    pub fn channel_count(&self) -> usize {
        self.data.nrows()
    }

    pub fn first_time(&self) -> f64 {
        self.time[0]
    }

    pub fn last_time(&self) -> f64 {
        self.time[self.time.len() - 1]
    }

    /// Mean of one channel over the block, `None` if the channel does not exist.
    pub fn channel_mean(&self, channel: usize) -> Option<f64> {
        (channel < self.data.nrows()).then(|| self.data.row(channel).mean())
    }

    pub fn rows(&self) -> Vec<Vec<f64>> {
        self.data
            .row_iter()
            .map(|row| row.iter().copied().collect())
            .collect()
    }

    fn shifted(mut self, offset: f64) -> Self {
        self.time.iter_mut().for_each(|t| *t += offset);
        self
    }
}

/// How [`TimeSeries::sample_block`] hands out stored data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyMode {
    /// Deep copy, independent of the store.
    #[default]
    Copy,
    /// Zero-copy view into the store; used by the scheduling hot path.
    Borrow,
}

/// Kinematic stream: ordered, non-overlapping sample blocks plus the session time base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    origin: DateTime<Utc>,
    start_offset: Option<f64>,
    blocks: Vec<SampleBlock>,
}

impl TimeSeries {
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            start_offset: None,
            blocks: Vec::new(),
        }
    }

    pub(crate) fn from_parts(
        origin: DateTime<Utc>,
        start_offset: Option<f64>,
        blocks: Vec<SampleBlock>,
    ) -> Result<Self> {
        if start_offset.is_none() && !blocks.is_empty() {
            return Err(Error::malformed("stored blocks without a start offset"));
        }
        for pair in blocks.windows(2) {
            if pair[1].first_time() <= pair[0].last_time() {
                return Err(Error::malformed("stored blocks overlap"));
            }
        }
        Ok(Self {
            origin,
            start_offset,
            blocks,
        })
    }

    pub fn origin(&self) -> DateTime<Utc> {
        self.origin
    }

    pub fn set_origin(&mut self, origin: DateTime<Utc>) {
        self.origin = origin;
    }

    pub fn start_offset(&self) -> Option<f64> {
        self.start_offset
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn has_data(&self) -> bool {
        !self.blocks.is_empty()
    }

    pub fn channel_count(&self) -> Option<usize> {
        self.blocks.first().map(SampleBlock::channel_count)
    }

    pub fn add(&mut self, relative_time: Vec<f64>, data: DMatrix<f64>) -> Result<()> {
        self.add_block_at(Utc::now(), SampleBlock::new(relative_time, data)?)
    }

    pub fn add_block(&mut self, block: SampleBlock) -> Result<()> {
        self.add_block_at(Utc::now(), block)
    }

    /// Appends a device-relative block received at `received_at`.
    ///
    /// The first block freezes the start offset so that its first sample lands on
    /// `received_at - origin`; later blocks reuse the frozen offset.
    pub fn add_block_at(&mut self, received_at: DateTime<Utc>, block: SampleBlock) -> Result<()> {
        if let Some(channels) = self.channel_count() {
            if block.channel_count() != channels {
                return Err(Error::malformed(format!(
                    "block has {} channels, series has {}",
                    block.channel_count(),
                    channels
                )));
            }
        }

        let offset = match self.start_offset {
            Some(offset) => offset,
            None => seconds_between(self.origin, received_at) - block.first_time(),
        };

        let block = block.shifted(offset);
        if let Some(previous) = self.blocks.last() {
            if block.first_time() <= previous.last_time() {
                return Err(Error::malformed(format!(
                    "block starting at {:.6}s overlaps previous block ending at {:.6}s",
                    block.first_time(),
                    previous.last_time()
                )));
            }
        }

        self.start_offset = Some(offset);
        self.blocks.push(block);
        Ok(())
    }

    /// Returns the block at `index`, or `None` when there is no such block yet.
    pub fn sample_block(&self, index: usize, mode: CopyMode) -> Option<Cow<'_, SampleBlock>> {
        let block = self.blocks.get(index)?;
        Some(match mode {
            CopyMode::Copy => Cow::Owned(block.clone()),
            CopyMode::Borrow => Cow::Borrowed(block),
        })
    }

    /// Block counted from the end (`0` is the most recent).
    pub fn recent_block(&self, back: usize, mode: CopyMode) -> Option<Cow<'_, SampleBlock>> {
        let index = self.blocks.len().checked_sub(back + 1)?;
        self.sample_block(index, mode)
    }

    pub fn sample_blocks(&self, range: Range<usize>, mode: CopyMode) -> Option<Cow<'_, [SampleBlock]>> {
        let blocks = self.blocks.get(range)?;
        if blocks.is_empty() {
            return None;
        }
        Some(match mode {
            CopyMode::Copy => Cow::Owned(blocks.to_vec()),
            CopyMode::Borrow => Cow::Borrowed(blocks),
        })
    }

    pub fn blocks(&self) -> &[SampleBlock] {
        &self.blocks
    }

    /// Offset-adjusted time of every stored sample, concatenated.
    pub fn time(&self) -> Vec<f64> {
        self.blocks
            .iter()
            .flat_map(|block| block.time().iter().copied())
            .collect()
    }

    /// All stored samples as one `channels x samples` matrix.
    pub fn as_array(&self) -> DMatrix<f64> {
        let channels = self.channel_count().unwrap_or(0);
        let width: usize = self.blocks.iter().map(SampleBlock::width).sum();
        let mut out = DMatrix::zeros(channels, width);

        let mut column = 0;
        for block in &self.blocks {
            out.columns_mut(column, block.width()).copy_from(block.data());
            column += block.width();
        }
        out
    }

    /// Copy of this series restricted to the blocks from `first_block` onwards.
    pub fn since(&self, first_block: usize) -> TimeSeries {
        TimeSeries {
            origin: self.origin,
            start_offset: self.start_offset,
            blocks: self.blocks.get(first_block..).map(<[_]>::to_vec).unwrap_or_default(),
        }
    }
}

impl Default for TimeSeries {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sine_block(first: usize, width: usize, dt: f64) -> SampleBlock {
        let time: Vec<f64> = (first..first + width).map(|i| i as f64 * dt).collect();
        let data = DMatrix::from_fn(2, width, |channel, i| {
            ((first + i) as f64 * dt).sin() + channel as f64
        });
        SampleBlock::new(time, data).unwrap()
    }

    #[test]
    fn test_empty_series() {
        let series = TimeSeries::default();
        assert!(!series.has_data());
        assert!(series.time().is_empty());
        assert_eq!(series.as_array().ncols(), 0);
        assert!(series.sample_block(0, CopyMode::Copy).is_none());
        assert!(series.recent_block(0, CopyMode::Borrow).is_none());
        assert!(series.start_offset().is_none());
    }

    #[test]
    fn test_offset_is_frozen_on_first_block() {
        let origin = Utc::now();
        let mut series = TimeSeries::new(origin);

        series
            .add_block_at(origin + Duration::milliseconds(250), sine_block(0, 10, 0.01))
            .unwrap();
        let offset = series.start_offset().unwrap();
        assert!((offset - 0.25).abs() < 1e-9);

        series
            .add_block_at(origin + Duration::seconds(5), sine_block(10, 10, 0.01))
            .unwrap();
        assert_eq!(series.start_offset(), Some(offset));
        assert!((series.blocks()[1].first_time() - (0.1 + offset)).abs() < 1e-9);
    }

    #[test]
    fn test_time_is_monotonic_and_width_adds_up() {
        let origin = Utc::now();
        let mut series = TimeSeries::new(origin);
        let widths = [5usize, 7, 3, 11];
        let mut first = 0;
        for width in widths {
            series
                .add_block_at(origin, sine_block(first, width, 0.001))
                .unwrap();
            first += width;
        }

        let time = series.time();
        assert!(time.windows(2).all(|pair| pair[1] >= pair[0]));
        assert_eq!(series.as_array().ncols(), widths.iter().sum::<usize>());
        assert_eq!(series.as_array().nrows(), 2);
        assert_eq!(time.len(), series.as_array().ncols());
    }

    #[test]
    fn test_overlapping_block_is_rejected() {
        let origin = Utc::now();
        let mut series = TimeSeries::new(origin);
        series.add_block_at(origin, sine_block(0, 10, 0.01)).unwrap();
        let result = series.add_block_at(origin, sine_block(5, 10, 0.01));
        assert!(matches!(result, Err(Error::MalformedInput(_))));
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn test_channel_count_must_not_change() {
        let mut series = TimeSeries::default();
        series.add_block(sine_block(0, 4, 0.01)).unwrap();
        let single = SampleBlock::from_rows(vec![1.0, 1.01], &[vec![0.0, 0.0]]).unwrap();
        assert!(series.add_block(single).is_err());
    }

    #[test]
    fn test_copy_mode_is_independent_of_store() {
        let mut series = TimeSeries::default();
        series.add_block(sine_block(0, 4, 0.01)).unwrap();
        let original = series.blocks()[0].data()[(0, 0)];

        let mut copy = series.sample_block(0, CopyMode::Copy).unwrap().into_owned();
        copy.data_mut()[(0, 0)] = 42.0;

        assert_eq!(series.blocks()[0].data()[(0, 0)], original);
    }

    #[test]
    fn test_borrow_mode_aliases_store() {
        let mut series = TimeSeries::default();
        series.add_block(sine_block(0, 4, 0.01)).unwrap();

        let view = series.sample_block(0, CopyMode::Borrow).unwrap();
        assert!(matches!(view, Cow::Borrowed(_)));
        assert!(std::ptr::eq(view.data().as_slice().as_ptr(), series.blocks()[0].data().as_slice().as_ptr()));

        let copy = series.sample_block(0, CopyMode::Copy).unwrap();
        assert!(!std::ptr::eq(copy.data().as_slice().as_ptr(), series.blocks()[0].data().as_slice().as_ptr()));
    }

    #[test]
    fn test_since_returns_tail() {
        let origin = Utc::now();
        let mut series = TimeSeries::new(origin);
        series.add_block_at(origin, sine_block(0, 4, 0.01)).unwrap();
        series.add_block_at(origin, sine_block(4, 4, 0.01)).unwrap();

        let tail = series.since(1);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail.start_offset(), series.start_offset());
        assert!(series.since(2).is_empty());
        assert!(series.since(9).is_empty());
    }

    #[test]
    fn test_timestamp_conversion() {
        let now = Utc::now();
        let back = from_timestamp_seconds(timestamp_seconds(now)).unwrap();
        assert!(seconds_between(now, back).abs() < 1e-6);
        assert!(from_timestamp_seconds(f64::NAN).is_err());
    }
}
