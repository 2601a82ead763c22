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

//! Kinematic acquisition device facade.
//!
//! An [`AcquisitionBackend`] pushes raw `channels x samples` matrices into a
//! sink once started. [`Sensor`] stamps each one with a contiguous
//! device-relative time vector and hands the resulting [`SampleBlock`] to its
//! data observers on the backend thread.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nalgebra::DMatrix;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::AcquisitionConfig;
use crate::error::{Error, Result};
use crate::observers::{ObserverList, SubscriptionToken};
use crate::timebase::SampleBlock;

/// Receives one raw `channels x samples` block.
pub type BlockSink = Arc<dyn Fn(DMatrix<f64>) + Send + Sync>;

/// Driver contract of an acquisition card.
pub trait AcquisitionBackend: Send {
    fn channel_count(&self) -> usize;
    /// Hz
    fn frame_rate(&self) -> f64;
    fn start(&mut self, sink: BlockSink) -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquisitionEvent {
    RecordingStarted { at: DateTime<Utc> },
    RecordingStopped { at: DateTime<Utc> },
}

struct SensorInner {
    backend: Mutex<Box<dyn AcquisitionBackend>>,
    connected: AtomicBool,
    recording: AtomicBool,
    last_time: Mutex<Option<f64>>,
    channel_count: usize,
    frame_rate: f64,
    data_observers: ObserverList<SampleBlock>,
    lifecycle_observers: ObserverList<AcquisitionEvent>,
}

impl SensorInner {
    fn deliver(&self, data: DMatrix<f64>) {
        if !self.connected.load(Ordering::SeqCst) || data.ncols() == 0 {
            return;
        }

        let period = 1.0 / self.frame_rate;
        let time: Vec<f64> = {
            let mut last_time = self.last_time.lock();
            let first = last_time.map_or(0.0, |last| last + period);
            let time: Vec<f64> = (0..data.ncols()).map(|i| first + i as f64 * period).collect();
            *last_time = time.last().copied();
            time
        };

        match SampleBlock::new(time, data) {
            Ok(block) => self.data_observers.notify(&block),
            Err(e) => warn!("Dropping acquisition block: {}", e),
        }
    }
}

/// Cloneable handle on the acquisition card.
#[derive(Clone)]
pub struct Sensor {
    inner: Arc<SensorInner>,
}

impl Sensor {
    pub fn new(backend: Box<dyn AcquisitionBackend>) -> Result<Self> {
        let channel_count = backend.channel_count();
        let frame_rate = backend.frame_rate();
        if channel_count == 0 || !(frame_rate > 0.0) {
            return Err(Error::configuration(format!(
                "acquisition backend reports {channel_count} channels at {frame_rate} Hz"
            )));
        }

        Ok(Sensor {
            inner: Arc::new(SensorInner {
                backend: Mutex::new(backend),
                connected: AtomicBool::new(false),
                recording: AtomicBool::new(false),
                last_time: Mutex::new(None),
                channel_count,
                frame_rate,
                data_observers: ObserverList::new(),
                lifecycle_observers: ObserverList::new(),
            }),
        })
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channel_count
    }

    pub fn frame_rate(&self) -> f64 {
        self.inner.frame_rate
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn is_recording(&self) -> bool {
        self.inner.recording.load(Ordering::SeqCst)
    }

    pub fn subscribe_data<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&SampleBlock) + Send + Sync + 'static,
    {
        self.inner.data_observers.subscribe(callback)
    }

    pub fn unsubscribe_data(&self, token: SubscriptionToken) -> bool {
        self.inner.data_observers.unsubscribe(token)
    }

    pub fn subscribe_lifecycle<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&AcquisitionEvent) + Send + Sync + 'static,
    {
        self.inner.lifecycle_observers.subscribe(callback)
    }

    pub fn unsubscribe_lifecycle(&self, token: SubscriptionToken) -> bool {
        self.inner.lifecycle_observers.unsubscribe(token)
    }

    /// Opens the device; data flows to the observers from now on.
    pub fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::precondition("acquisition device is already connected"));
        }

        let weak: Weak<SensorInner> = Arc::downgrade(&self.inner);
        let sink: BlockSink = Arc::new(move |data| {
            if let Some(inner) = weak.upgrade() {
                inner.deliver(data);
            }
        });

        *self.inner.last_time.lock() = None;
        self.inner.connected.store(true, Ordering::SeqCst);
        if let Err(e) = self.inner.backend.lock().start(sink) {
            self.inner.connected.store(false, Ordering::SeqCst);
            return Err(Error::device(e));
        }

        info!(
            "Acquisition connected: {} channels at {} Hz",
            self.inner.channel_count, self.inner.frame_rate
        );
        Ok(())
    }

    /// Stops the device. Idempotent; no block reaches the observers once it returns.
    pub fn disconnect(&self) -> Result<()> {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.recording.swap(false, Ordering::SeqCst) {
            self.notify_lifecycle(AcquisitionEvent::RecordingStopped { at: Utc::now() });
        }

        self.inner.backend.lock().stop().map_err(Error::device)?;
        info!("Acquisition disconnected");
        Ok(())
    }

    pub fn start_recording(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::precondition("acquisition device is not connected"));
        }
        if self.inner.recording.swap(true, Ordering::SeqCst) {
            return Err(Error::precondition("acquisition is already recording"));
        }
        self.notify_lifecycle(AcquisitionEvent::RecordingStarted { at: Utc::now() });
        Ok(())
    }

    pub fn stop_recording(&self) -> Result<()> {
        if !self.inner.recording.swap(false, Ordering::SeqCst) {
            return Err(Error::precondition("acquisition is not recording"));
        }
        self.notify_lifecycle(AcquisitionEvent::RecordingStopped { at: Utc::now() });
        Ok(())
    }

    fn notify_lifecycle(&self, event: AcquisitionEvent) {
        debug!("Acquisition lifecycle: {:?}", event);
        self.inner.lifecycle_observers.notify(&event);
    }
}

/// Synthetic gait signal: a 1 Hz sine on the first channel, streamed in real time.
pub struct SineWaveBackend {
    channel_count: usize,
    frame_rate: f64,
    samples_per_block: usize,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SineWaveBackend {
    pub fn new(config: &AcquisitionConfig) -> Self {
        SineWaveBackend {
            channel_count: config.channels,
            frame_rate: config.frame_rate,
            samples_per_block: config.samples_per_block(),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl AcquisitionBackend for SineWaveBackend {
    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    fn start(&mut self, sink: BlockSink) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("Sine wave generator is already running");
        }

        let running = Arc::clone(&self.running);
        let channels = self.channel_count;
        let width = self.samples_per_block;
        let frame_rate = self.frame_rate;
        let block_period = Duration::from_secs_f64(width as f64 / frame_rate);

        let handle = thread::Builder::new()
            .name("sine-acquisition".to_string())
            .spawn(move || {
                let mut sample = 0usize;
                while running.load(Ordering::SeqCst) {
                    thread::sleep(block_period);
                    let data = DMatrix::from_fn(channels, width, |channel, i| {
                        let t = (sample + i) as f64 / frame_rate;
                        (TAU * t).sin() * if channel == 0 { 1.0 } else { 0.5 }
                    });
                    sample += width;
                    sink(data);
                }
            })?;
        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("Sine wave generator thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for SineWaveBackend {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Deterministic backend: blocks are pushed by the test through a [`ScriptedFeed`].
pub struct ScriptedBackend {
    channel_count: usize,
    frame_rate: f64,
    sink: Arc<Mutex<Option<BlockSink>>>,
}

/// Test-side handle feeding a [`ScriptedBackend`].
#[derive(Clone)]
pub struct ScriptedFeed {
    channel_count: usize,
    sink: Arc<Mutex<Option<BlockSink>>>,
}

impl ScriptedBackend {
    pub fn new(channel_count: usize, frame_rate: f64) -> (Self, ScriptedFeed) {
        let sink = Arc::new(Mutex::new(None));
        let feed = ScriptedFeed {
            channel_count,
            sink: Arc::clone(&sink),
        };
        (
            ScriptedBackend {
                channel_count,
                frame_rate,
                sink,
            },
            feed,
        )
    }
}

impl AcquisitionBackend for ScriptedBackend {
    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    fn start(&mut self, sink: BlockSink) -> anyhow::Result<()> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        *self.sink.lock() = None;
        Ok(())
    }
}

impl ScriptedFeed {
    /// Delivers `data` synchronously; returns false while the backend is stopped.
    pub fn push(&self, data: DMatrix<f64>) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink(data);
                true
            }
            None => false,
        }
    }

    /// Delivers a block where every channel holds `value` for `width` samples.
    pub fn push_constant(&self, value: f64, width: usize) -> bool {
        self.push(DMatrix::from_element(self.channel_count, width, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn scripted_sensor() -> (Sensor, ScriptedFeed) {
        let (backend, feed) = ScriptedBackend::new(1, 100.0);
        (Sensor::new(Box::new(backend)).unwrap(), feed)
    }

    fn collect_blocks(sensor: &Sensor) -> Arc<Mutex<Vec<SampleBlock>>> {
        let blocks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&blocks);
        sensor.subscribe_data(move |block| sink.lock().push(block.clone()));
        blocks
    }

    #[test]
    fn test_blocks_get_contiguous_time() {
        let (sensor, feed) = scripted_sensor();
        let blocks = collect_blocks(&sensor);

        assert!(!feed.push_constant(0.0, 5));
        sensor.connect().unwrap();
        feed.push_constant(0.1, 5);
        feed.push_constant(0.2, 3);

        let blocks = blocks.lock();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].first_time(), 0.0);
        assert!((blocks[1].first_time() - (blocks[0].last_time() + 0.01)).abs() < 1e-12);
        assert_eq!(blocks[1].width(), 3);
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let (sensor, _feed) = scripted_sensor();
        sensor.connect().unwrap();
        assert!(matches!(sensor.connect(), Err(Error::Precondition(_))));
    }

    #[test]
    fn test_recording_lifecycle_notifications() {
        let (sensor, _feed) = scripted_sensor();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        sensor.subscribe_lifecycle(move |event| sink.lock().push(*event));

        assert!(sensor.start_recording().is_err());
        sensor.connect().unwrap();
        sensor.start_recording().unwrap();
        assert!(matches!(sensor.start_recording(), Err(Error::Precondition(_))));
        sensor.disconnect().unwrap();
        sensor.disconnect().unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], AcquisitionEvent::RecordingStarted { .. }));
        assert!(matches!(events[1], AcquisitionEvent::RecordingStopped { .. }));
    }

    #[test]
    fn test_no_data_after_disconnect() {
        let (sensor, feed) = scripted_sensor();
        let blocks = collect_blocks(&sensor);
        sensor.connect().unwrap();
        feed.push_constant(1.0, 2);
        sensor.disconnect().unwrap();
        feed.push_constant(1.0, 2);
        assert_eq!(blocks.lock().len(), 1);
    }

    #[test]
    fn test_sine_wave_backend_streams() {
        let config = AcquisitionConfig {
            channels: 2,
            frame_rate: 1000.0,
            block_duration: 0.01,
        };
        let sensor = Sensor::new(Box::new(SineWaveBackend::new(&config))).unwrap();
        let blocks = collect_blocks(&sensor);
        sensor.connect().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while blocks.lock().len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        sensor.disconnect().unwrap();

        let blocks = blocks.lock();
        assert!(blocks.len() >= 3);
        assert_eq!(blocks[0].channel_count(), 2);
        assert_eq!(blocks[0].width(), 10);
    }
}
