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

use crate::shared_types::Side;
use crate::timebase::{CopyMode, TimeSeries};

/// Returned when there is not enough data, or the trajectory direction is ambiguous.
/// Callers skip evaluation for the cycle instead of treating it as a phase.
pub const PHASE_UNAVAILABLE: f64 = -1.0;

pub fn is_available(phase: f64) -> bool {
    phase >= 0.0
}

/// Stride percentage [0; 1] of the given leg, from the two most recent blocks.
///
/// The right leg uses the same estimate with the signal sign inverted.
/// `Side::Both` has no single phase and always yields [`PHASE_UNAVAILABLE`].
pub fn percentage_of_stride(series: &TimeSeries, side: Side) -> f64 {
    let sign = match side {
        Side::Left => 1.0,
        Side::Right => -1.0,
        Side::Both => return PHASE_UNAVAILABLE,
    };

    let (Some(previous), Some(current)) = (
        series.recent_block(1, CopyMode::Borrow),
        series.recent_block(0, CopyMode::Borrow),
    ) else {
        return PHASE_UNAVAILABLE;
    };

    match (previous.channel_mean(0), current.channel_mean(0)) {
        (Some(previous), Some(current)) => stride_quadrant(sign * previous, sign * current),
        _ => PHASE_UNAVAILABLE,
    }
}

/// Four quadrants by sign of the current mean and direction of change:
/// rising positive, falling positive, falling negative, rising negative.
fn stride_quadrant(previous: f64, current: f64) -> f64 {
    let phase = if current >= 0.0 && current > previous {
        0.25 * current
    } else if current >= 0.0 && current < previous {
        0.25 + 0.25 * (1.0 - current)
    } else if current < 0.0 && current < previous {
        0.5 + 0.25 * previous.abs()
    } else if current < 0.0 && current > previous {
        0.75 + 0.25 * (1.0 - previous.abs())
    } else {
        return PHASE_UNAVAILABLE;
    };
    phase.clamp(0.0, 1.0)
}
