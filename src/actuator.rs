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

//! Stimulation device facade.
//!
//! [`Stimulator`] wraps a [`StimulatorBackend`] (the hardware driver or the
//! deterministic [`FakeStimulatorBackend`]), keeps the per-channel pulse
//! parameters and notifies observers when stimulation starts or stops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::StimulatorConfig;
use crate::error::{Error, Result};
use crate::observers::{ObserverList, SubscriptionToken};
use crate::shared_types::ParamValue;

/// Pulse parameters of one output channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// mA
    pub amplitude: f64,
    /// µs
    pub pulse_width: f64,
}

/// Driver contract of a stimulation unit.
pub trait StimulatorBackend: Send {
    fn channel_count(&self) -> usize;
    fn init_channels(&mut self, channels: &[ChannelConfig]) -> anyhow::Result<()>;
    fn start(&mut self, channels: &[ChannelConfig]) -> anyhow::Result<()>;
    fn pause(&mut self) -> anyhow::Result<()>;
    /// Milliseconds between two pulses
    fn set_pulse_interval(&mut self, interval: f64) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum StimulatorEvent {
    Started {
        at: DateTime<Utc>,
        duration: Option<f64>,
        amplitudes: Vec<f64>,
    },
    Stopped {
        at: DateTime<Utc>,
    },
}

/// Who asked for a pause; decides which checks run once the device is locked.
#[derive(Debug, Clone, Copy)]
enum PauseCause {
    Request,
    Timer(u64),
    Disconnect,
}

struct Device {
    backend: Box<dyn StimulatorBackend>,
    channels: Vec<ChannelConfig>,
    pulse_interval: f64,
    initialized: bool,
    stimulating: bool,
}

struct StimulatorInner {
    device: Mutex<Device>,
    observers: ObserverList<StimulatorEvent>,
    timer_generation: AtomicU64,
    disconnected: AtomicBool,
    channel_count: usize,
    max_amplitude: f64,
}

/// Cloneable handle on the stimulation unit.
#[derive(Clone)]
pub struct Stimulator {
    inner: Arc<StimulatorInner>,
}

impl Stimulator {
    pub fn new(backend: Box<dyn StimulatorBackend>, config: &StimulatorConfig) -> Result<Self> {
        let channel_count = backend.channel_count();
        if channel_count == 0 {
            return Err(Error::configuration("stimulator reports no channel"));
        }

        let channels = vec![
            ChannelConfig {
                amplitude: 0.0,
                pulse_width: config.pulse_width,
            };
            channel_count
        ];

        info!("Stimulator created with {} channels", channel_count);
        Ok(Stimulator {
            inner: Arc::new(StimulatorInner {
                device: Mutex::new(Device {
                    backend,
                    channels,
                    pulse_interval: config.pulse_interval,
                    initialized: false,
                    stimulating: false,
                }),
                observers: ObserverList::new(),
                timer_generation: AtomicU64::new(0),
                disconnected: AtomicBool::new(false),
                channel_count,
                max_amplitude: config.max_amplitude,
            }),
        })
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channel_count
    }

    pub fn max_amplitude(&self) -> f64 {
        self.inner.max_amplitude
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&StimulatorEvent) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(callback)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.inner.observers.unsubscribe(token)
    }

    pub fn is_stimulating(&self) -> bool {
        self.inner.device.lock().stimulating
    }

    /// Starts (or refreshes) stimulation with the current channel parameters.
    ///
    /// With `Some(duration)` the stimulation pauses itself after `duration`
    /// seconds unless a newer start or a pause happened in between.
    pub fn start_stimulation(&self, duration: Option<f64>) -> Result<()> {
        if let Some(duration) = duration {
            if !duration.is_finite() || duration <= 0.0 {
                return Err(Error::malformed(format!("invalid stimulation duration {duration}")));
            }
        }
        self.ensure_connected()?;

        let event = {
            let mut device = self.inner.device.lock();
            self.ensure_connected()?;
            let Device {
                backend,
                channels,
                pulse_interval,
                initialized,
                ..
            } = &mut *device;

            if !*initialized {
                debug!("Initializing {} stimulation channels", channels.len());
                backend.init_channels(channels).map_err(Error::device)?;
                backend.set_pulse_interval(*pulse_interval).map_err(Error::device)?;
                *initialized = true;
            }
            backend.start(channels).map_err(Error::device)?;
            device.stimulating = true;

            StimulatorEvent::Started {
                at: Utc::now(),
                duration,
                amplitudes: device.channels.iter().map(|channel| channel.amplitude).collect(),
            }
        };

        let generation = self.inner.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(duration) = duration {
            self.spawn_stop_timer(generation, duration)?;
        }

        self.inner.observers.notify(&event);
        Ok(())
    }

    /// Pauses stimulation; a no-op before the channels were ever initialized.
    pub fn pause_stimulation(&self) -> Result<()> {
        self.inner.timer_generation.fetch_add(1, Ordering::SeqCst);
        Self::pause_device(&self.inner, PauseCause::Request)
    }

    /// Checks `cause` against the disconnect flag and timer generation with the device held.
    fn pause_device(inner: &StimulatorInner, cause: PauseCause) -> Result<()> {
        let was_stimulating = {
            let mut device = inner.device.lock();
            let disconnected = inner.disconnected.load(Ordering::SeqCst);
            let stale = match cause {
                PauseCause::Request => disconnected,
                PauseCause::Timer(generation) => {
                    disconnected || inner.timer_generation.load(Ordering::SeqCst) != generation
                }
                PauseCause::Disconnect => false,
            };
            if stale || !device.initialized {
                return Ok(());
            }
            device.backend.pause().map_err(Error::device)?;
            std::mem::replace(&mut device.stimulating, false)
        };

        if was_stimulating {
            inner.observers.notify(&StimulatorEvent::Stopped { at: Utc::now() });
        }
        Ok(())
    }

    fn spawn_stop_timer(&self, generation: u64, duration: f64) -> Result<()> {
        let inner: Weak<StimulatorInner> = Arc::downgrade(&self.inner);
        thread::Builder::new()
            .name("stimulation-timer".to_string())
            .spawn(move || {
                thread::sleep(Duration::from_secs_f64(duration));
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                debug!("Timed stimulation of {:.3}s elapsed", duration);
                if let Err(e) = Self::pause_device(&inner, PauseCause::Timer(generation)) {
                    warn!("Failed to end timed stimulation: {}", e);
                }
            })?;
        Ok(())
    }

    pub fn amplitudes(&self) -> Vec<f64> {
        self.inner.device.lock().channels.iter().map(|channel| channel.amplitude).collect()
    }

    pub fn pulse_widths(&self) -> Vec<f64> {
        self.inner.device.lock().channels.iter().map(|channel| channel.pulse_width).collect()
    }

    pub fn pulse_interval(&self) -> f64 {
        self.inner.device.lock().pulse_interval
    }

    pub fn set_amplitude(&self, value: ParamValue<f64>) -> Result<()> {
        let amplitudes = value.expand(self.channel_count())?;
        self.update_amplitudes(&amplitudes.into_iter().map(Some).collect::<Vec<_>>())
    }

    /// Sets the amplitude of every channel holding `Some`, leaving the others as they are.
    pub fn update_amplitudes(&self, amplitudes: &[Option<f64>]) -> Result<()> {
        if amplitudes.len() != self.channel_count() {
            return Err(Error::malformed(format!(
                "expected {} amplitudes, got {}",
                self.channel_count(),
                amplitudes.len()
            )));
        }
        for amplitude in amplitudes.iter().flatten() {
            if !amplitude.is_finite() || *amplitude < 0.0 || *amplitude > self.inner.max_amplitude {
                return Err(Error::malformed(format!(
                    "amplitude {} outside [0, {}] mA",
                    amplitude, self.inner.max_amplitude
                )));
            }
        }

        let mut device = self.inner.device.lock();
        for (channel, amplitude) in device.channels.iter_mut().zip(amplitudes) {
            if let Some(amplitude) = amplitude {
                channel.amplitude = *amplitude;
            }
        }
        Ok(())
    }

    pub fn set_pulse_width(&self, value: ParamValue<f64>) -> Result<()> {
        let widths = value.expand(self.channel_count())?;
        if let Some(width) = widths.iter().find(|width| !width.is_finite() || **width <= 0.0) {
            return Err(Error::malformed(format!("invalid pulse width {width}")));
        }

        let mut device = self.inner.device.lock();
        for (channel, width) in device.channels.iter_mut().zip(widths) {
            channel.pulse_width = width;
        }
        Ok(())
    }

    pub fn set_pulse_interval(&self, interval: f64) -> Result<()> {
        if !interval.is_finite() || interval <= 0.0 {
            return Err(Error::malformed(format!("invalid pulse interval {interval}")));
        }
        self.ensure_connected()?;

        let mut device = self.inner.device.lock();
        self.ensure_connected()?;
        device.backend.set_pulse_interval(interval).map_err(Error::device)?;
        device.pulse_interval = interval;
        Ok(())
    }

    /// Pauses any stimulation and refuses further hardware calls. Idempotent.
    pub fn disconnect(&self) -> Result<()> {
        if self.inner.disconnected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Disconnecting stimulator");
        self.inner.timer_generation.fetch_add(1, Ordering::SeqCst);
        Self::pause_device(&self.inner, PauseCause::Disconnect)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.inner.disconnected.load(Ordering::SeqCst) {
            return Err(Error::precondition("stimulator is disconnected"));
        }
        Ok(())
    }
}

/// Call recorded by [`FakeStimulatorBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum StimulatorCall {
    InitChannels(usize),
    Start(Vec<f64>),
    Pause,
    PulseInterval(f64),
}

#[derive(Debug, Default)]
struct FakeStimulatorLog {
    calls: Vec<StimulatorCall>,
    fail_next_start: bool,
}

/// Inspection handle on a [`FakeStimulatorBackend`].
#[derive(Clone, Default)]
pub struct FakeStimulatorHandle {
    log: Arc<Mutex<FakeStimulatorLog>>,
}

impl FakeStimulatorHandle {
    pub fn calls(&self) -> Vec<StimulatorCall> {
        self.log.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.log.lock().calls.len()
    }

    pub fn last_start(&self) -> Option<Vec<f64>> {
        self.log.lock().calls.iter().rev().find_map(|call| match call {
            StimulatorCall::Start(amplitudes) => Some(amplitudes.clone()),
            _ => None,
        })
    }

    pub fn fail_next_start(&self) {
        self.log.lock().fail_next_start = true;
    }
}

/// In-memory stimulator that records every driver call.
pub struct FakeStimulatorBackend {
    channel_count: usize,
    log: Arc<Mutex<FakeStimulatorLog>>,
}

impl FakeStimulatorBackend {
    pub fn new(channel_count: usize) -> (Self, FakeStimulatorHandle) {
        let handle = FakeStimulatorHandle::default();
        let backend = FakeStimulatorBackend {
            channel_count,
            log: Arc::clone(&handle.log),
        };
        (backend, handle)
    }
}

impl StimulatorBackend for FakeStimulatorBackend {
    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn init_channels(&mut self, channels: &[ChannelConfig]) -> anyhow::Result<()> {
        self.log.lock().calls.push(StimulatorCall::InitChannels(channels.len()));
        Ok(())
    }

    fn start(&mut self, channels: &[ChannelConfig]) -> anyhow::Result<()> {
        let mut log = self.log.lock();
        if std::mem::take(&mut log.fail_next_start) {
            anyhow::bail!("simulated stimulator fault");
        }
        log.calls
            .push(StimulatorCall::Start(channels.iter().map(|channel| channel.amplitude).collect()));
        Ok(())
    }

    fn pause(&mut self) -> anyhow::Result<()> {
        self.log.lock().calls.push(StimulatorCall::Pause);
        Ok(())
    }

    fn set_pulse_interval(&mut self, interval: f64) -> anyhow::Result<()> {
        self.log.lock().calls.push(StimulatorCall::PulseInterval(interval));
        Ok(())
    }
}
