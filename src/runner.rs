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

//! Session runner: owns both device facades and the scheduler.
//!
//! The continuous session is always subscribed to both devices and backs the
//! scheduler. A trial session is created by [`Runner::start_recording`] and only
//! receives data until [`Runner::stop_recording`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::actuator::{Stimulator, StimulatorBackend, StimulatorEvent};
use crate::config::StimulatorConfig;
use crate::error::{Error, Result};
use crate::observers::SubscriptionToken;
use crate::rule::{RuleInfo, RuleTemplate, TemplateInfo};
use crate::scheduler::{RuleId, Scheduler};
use crate::sensor::{AcquisitionBackend, Sensor};
use crate::session::{Session, SessionCursor};
use crate::shared_types::{DeviceInfo, ParamValue, RunnerState, RunnerStatus, Side};
use crate::timebase::timestamp_seconds;

pub type SharedSession = Arc<RwLock<Session>>;

#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    pub stimulator: StimulatorConfig,
    /// Relative trial filenames are resolved against this directory
    pub trials_dir: PathBuf,
}

/// Observer tokens tying a session to the devices.
struct SessionLink {
    data: SubscriptionToken,
    stimulation: SubscriptionToken,
}

pub struct Runner {
    sensor: Sensor,
    stimulator: Stimulator,
    scheduler: Scheduler,
    templates: Vec<RuleTemplate>,
    config: RunnerConfig,
    continuous: SharedSession,
    trial: Mutex<Option<SharedSession>>,
    trial_link: Mutex<Option<SessionLink>>,
    fetch_cursor: Mutex<SessionCursor>,
    lifecycle: Mutex<()>,
}

impl Runner {
    pub fn new(
        acquisition: Box<dyn AcquisitionBackend>,
        stimulation: Box<dyn StimulatorBackend>,
        templates: Vec<RuleTemplate>,
        config: RunnerConfig,
    ) -> Result<Self> {
        let sensor = Sensor::new(acquisition)?;
        let stimulator = Stimulator::new(stimulation, &config.stimulator)?;

        let continuous: SharedSession = Arc::new(RwLock::new(Session::default()));
        // The continuous session stays linked for the runner's lifetime
        link_session(&continuous, &sensor, &stimulator);
        let scheduler = Scheduler::start(Arc::clone(&continuous), stimulator.clone())?;
        // Nothing is evaluated before the acquisition device is connected
        scheduler.pause();

        info!(
            "Runner ready: {} acquisition channels, {} stimulation channels, {} rule templates",
            sensor.channel_count(),
            stimulator.channel_count(),
            templates.len()
        );

        Ok(Runner {
            sensor,
            stimulator,
            scheduler,
            templates,
            config,
            continuous,
            trial: Mutex::new(None),
            trial_link: Mutex::new(None),
            fetch_cursor: Mutex::new(SessionCursor::default()),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn sensor(&self) -> &Sensor {
        &self.sensor
    }

    pub fn stimulator(&self) -> &Stimulator {
        &self.stimulator
    }

    pub fn continuous_session(&self) -> SharedSession {
        Arc::clone(&self.continuous)
    }

    pub fn status(&self) -> RunnerStatus {
        let state = if self.sensor.is_recording() {
            RunnerState::Recording
        } else if self.sensor.is_connected() {
            RunnerState::Connected
        } else {
            RunnerState::Disconnected
        };
        RunnerStatus {
            state,
            stimulating: self.stimulator.is_stimulating(),
        }
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            origin_timestamp: timestamp_seconds(self.continuous.read().origin()),
            acquisition_channels: self.sensor.channel_count(),
            stimulation_channels: self.stimulator.channel_count(),
            frame_rate: self.sensor.frame_rate(),
        }
    }

    /// Opens the acquisition device and restarts the continuous session.
    pub fn connect(&self) -> Result<()> {
        let _guard = self.lifecycle.lock();
        if self.sensor.is_connected() {
            return Err(Error::precondition("already connected"));
        }

        info!("Connecting acquisition device");
        *self.continuous.write() = Session::new(Utc::now());
        *self.fetch_cursor.lock() = SessionCursor::default();
        self.sensor.connect()?;
        self.scheduler.resume();
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        let _guard = self.lifecycle.lock();
        if !self.sensor.is_connected() {
            return Err(Error::precondition("not connected"));
        }
        if self.sensor.is_recording() {
            return Err(Error::precondition("stop recording before disconnecting"));
        }
        self.disconnect_devices()
    }

    /// Rules stay scheduled but are neither evaluated nor stimulating until the next connect.
    fn disconnect_devices(&self) -> Result<()> {
        info!("Disconnecting acquisition device");
        self.scheduler.pause();
        self.scheduler.reset_rules();
        self.stimulator.pause_stimulation()?;
        self.sensor.disconnect()
    }

    /// Starts a fresh trial session linked to both devices.
    pub fn start_recording(&self) -> Result<()> {
        let _guard = self.lifecycle.lock();
        if !self.sensor.is_connected() {
            return Err(Error::precondition("not connected"));
        }
        if self.sensor.is_recording() {
            return Err(Error::precondition("already recording"));
        }

        let trial: SharedSession = Arc::new(RwLock::new(Session::new(Utc::now())));
        let link = link_session(&trial, &self.sensor, &self.stimulator);
        if let Err(e) = self.sensor.start_recording() {
            self.unlink_session(link);
            return Err(e);
        }

        *self.trial.lock() = Some(trial);
        *self.trial_link.lock() = Some(link);
        info!("Recording started");
        Ok(())
    }

    pub fn stop_recording(&self) -> Result<()> {
        let _guard = self.lifecycle.lock();
        self.stop_recording_locked()
    }

    fn stop_recording_locked(&self) -> Result<()> {
        if !self.sensor.is_recording() {
            return Err(Error::precondition("not recording"));
        }

        if let Some(link) = self.trial_link.lock().take() {
            self.unlink_session(link);
        }
        let paused = self.stimulator.pause_stimulation();
        if let Some(trial) = self.trial.lock().as_ref() {
            // The trial no longer hears the stop notification
            trial.write().stimulation_mut().stop(Utc::now());
        }
        self.sensor.stop_recording()?;
        paused?;

        if let Some(trial) = self.trial.lock().as_ref() {
            let trial = trial.read();
            info!(
                "Recording stopped: {} blocks, {} stimulation events",
                trial.kinematics().len(),
                trial.stimulation().len()
            );
        }
        Ok(())
    }

    fn unlink_session(&self, link: SessionLink) {
        self.sensor.unsubscribe_data(link.data);
        self.stimulator.unsubscribe(link.stimulation);
    }

    /// Manual stimulation; `duration` 0 stimulates until [`Runner::stop_stimulation`].
    pub fn stimulate(&self, duration: f64, amplitude: Option<f64>, pulse_width: Option<f64>) -> Result<()> {
        if !duration.is_finite() || duration < 0.0 {
            return Err(Error::malformed(format!("invalid stimulation duration {duration}")));
        }
        if !self.sensor.is_connected() {
            return Err(Error::precondition("not connected"));
        }

        let amplitude = amplitude.unwrap_or(self.config.stimulator.amplitude);
        self.stimulator.set_amplitude(ParamValue::Broadcast(amplitude))?;
        if let Some(pulse_width) = pulse_width {
            self.stimulator.set_pulse_width(ParamValue::Broadcast(pulse_width))?;
        }

        info!("Stimulating at {} mA for {}", amplitude, describe_duration(duration));
        self.stimulator
            .start_stimulation((duration > 0.0).then_some(duration))
    }

    pub fn stop_stimulation(&self) -> Result<()> {
        info!("Stopping stimulation");
        self.stimulator.pause_stimulation()
    }

    pub fn templates(&self) -> Vec<TemplateInfo> {
        self.templates
            .iter()
            .enumerate()
            .map(|(index, template)| template.info(index))
            .collect()
    }

    /// Instantiates template `index` for `side` and hands the rules to the scheduler.
    pub fn schedule(&self, index: usize, side: Side) -> Result<Vec<RuleId>> {
        let template = self.templates.get(index).ok_or_else(|| {
            Error::malformed(format!(
                "no rule template {index}, {} available",
                self.templates.len()
            ))
        })?;

        let rules = template.instantiate(side)?;
        info!("Scheduling template '{}' on {} ({} rules)", template.name(), side, rules.len());
        rules.into_iter().map(|rule| self.scheduler.add(rule)).collect()
    }

    pub fn scheduled_rules(&self) -> Result<Vec<RuleInfo>> {
        Ok(self.scheduler.list()?.into_iter().map(|(_, info)| info).collect())
    }

    /// Removes the rule at `index` in [`Runner::scheduled_rules`] order.
    pub fn unschedule(&self, index: usize) -> Result<RuleInfo> {
        let rules = self.scheduler.list()?;
        let (id, _) = rules.get(index).ok_or_else(|| {
            Error::malformed(format!("no scheduled rule {index}, {} scheduled", rules.len()))
        })?;
        let removed = self
            .scheduler
            .remove(*id)?
            .ok_or_else(|| Error::precondition(format!("rule {id} was already removed")))?;
        info!("Unscheduled rule '{}'", removed.name);
        Ok(removed)
    }

    /// Moves the incremental fetch cursor to the current end of the continuous session.
    pub fn start_fetch(&self) {
        *self.fetch_cursor.lock() = self.continuous.read().end_cursor();
    }

    /// Continuous data appended since the previous fetch, or everything with `from_top`.
    ///
    /// The cursor is shared by every caller.
    pub fn fetch_continuous(&self, from_top: bool) -> Session {
        let session = self.continuous.read();
        let mut cursor = self.fetch_cursor.lock();
        let start = if from_top { SessionCursor::default() } else { *cursor };
        *cursor = session.end_cursor();
        session.since(start)
    }

    pub fn last_trial(&self) -> Option<Session> {
        self.trial.lock().as_ref().map(|trial| trial.read().clone())
    }

    /// Saves the last trial; relative paths land in the trials directory.
    pub fn save_trial(&self, path: &Path) -> Result<PathBuf> {
        if self.sensor.is_recording() {
            return Err(Error::precondition("cannot save while recording"));
        }
        let trial = self
            .trial
            .lock()
            .clone()
            .ok_or_else(|| Error::precondition("no trial recorded yet"))?;

        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.trials_dir.join(path)
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        trial.read().save(&path)?;
        Ok(path)
    }

    /// Server-local summary of the last trial.
    pub fn plot_trial(&self) -> Result<()> {
        let trial = self
            .trial
            .lock()
            .clone()
            .ok_or_else(|| Error::precondition("no trial recorded yet"))?;
        let trial = trial.read();

        let time = trial.kinematics().time();
        let span = match (time.first(), time.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        };
        info!(
            "Trial: {:.2}s of kinematics over {} channels, {} stimulations ({} still open)",
            span,
            trial.kinematics().channel_count().unwrap_or(0),
            trial.stimulation().len(),
            trial.stimulation().events().iter().filter(|event| event.is_open()).count()
        );
        for (time, duration) in trial.stimulation().time().iter().zip(trial.stimulation().durations()) {
            info!("  stimulation at {:.3}s for {:.3}s", time, duration);
        }
        Ok(())
    }

    /// Brings the devices back to idle after a client went away. Never fails.
    pub fn teardown(&self) {
        let _guard = self.lifecycle.lock();
        if self.sensor.is_recording() {
            if let Err(e) = self.stop_recording_locked() {
                warn!("Failed to stop recording during teardown: {}", e);
            }
        }
        if self.sensor.is_connected() {
            if let Err(e) = self.disconnect_devices() {
                warn!("Failed to disconnect during teardown: {}", e);
            }
        } else if let Err(e) = self.stimulator.pause_stimulation() {
            warn!("Failed to pause stimulation during teardown: {}", e);
        }
    }

    /// Tears down, stops the scheduler and releases the stimulator. Idempotent.
    pub fn dispose(&self) {
        self.teardown();
        self.scheduler.dispose();
        debug!("Scheduler totals: {:?}", self.scheduler.metrics());
        if let Err(e) = self.stimulator.disconnect() {
            warn!("Failed to disconnect stimulator: {}", e);
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn describe_duration(duration: f64) -> String {
    if duration > 0.0 {
        format!("{duration}s")
    } else {
        "an open-ended period".to_string()
    }
}

/// Subscribes `session` to kinematic blocks and stimulation events.
fn link_session(session: &SharedSession, sensor: &Sensor, stimulator: &Stimulator) -> SessionLink {
    let kinematics = Arc::clone(session);
    let data = sensor.subscribe_data(move |block| {
        if let Err(e) = kinematics.write().kinematics_mut().add_block(block.clone()) {
            warn!("Dropping kinematic block: {}", e);
        }
    });

    let events = Arc::clone(session);
    let stimulation = stimulator.subscribe(move |event| {
        let mut session = events.write();
        match event {
            StimulatorEvent::Started {
                at,
                duration,
                amplitudes,
            } => {
                if let Err(e) = session.stimulation_mut().add(*at, *duration, Some(amplitudes)) {
                    warn!("Dropping stimulation event: {}", e);
                }
            }
            StimulatorEvent::Stopped { at } => session.stimulation_mut().stop(*at),
        }
    });

    SessionLink { data, stimulation }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{FakeStimulatorBackend, FakeStimulatorHandle, StimulatorCall};
    use crate::rule::{Comparison, ConditionDescription, PulseDescription, RuleDescription};
    use crate::sensor::{ScriptedBackend, ScriptedFeed};

    struct Fixture {
        runner: Runner,
        feed: ScriptedFeed,
        stimulator: FakeStimulatorHandle,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        fixture_with(vec![RuleTemplate::SwingPhase { amplitude: 50.0 }])
    }

    fn fixture_with(templates: Vec<RuleTemplate>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (acquisition, feed) = ScriptedBackend::new(1, 100.0);
        let (stimulation, stimulator) = FakeStimulatorBackend::new(8);
        let config = RunnerConfig {
            stimulator: StimulatorConfig::default(),
            trials_dir: dir.path().to_path_buf(),
        };
        let runner = Runner::new(Box::new(acquisition), Box::new(stimulation), templates, config).unwrap();
        Fixture {
            runner,
            feed,
            stimulator,
            _dir: dir,
        }
    }

    #[test]
    fn test_state_machine_preconditions() {
        let f = fixture();
        assert_eq!(f.runner.status().state, RunnerState::Disconnected);
        assert!(matches!(f.runner.start_recording(), Err(Error::Precondition(_))));
        assert!(matches!(f.runner.disconnect(), Err(Error::Precondition(_))));

        f.runner.connect().unwrap();
        assert!(matches!(f.runner.connect(), Err(Error::Precondition(_))));

        f.runner.start_recording().unwrap();
        assert_eq!(f.runner.status().state, RunnerState::Recording);
        assert!(matches!(f.runner.start_recording(), Err(Error::Precondition(_))));
        assert!(matches!(f.runner.disconnect(), Err(Error::Precondition(_))));
        assert!(matches!(f.runner.save_trial(Path::new("t.json")), Err(Error::Precondition(_))));

        f.runner.stop_recording().unwrap();
        assert!(matches!(f.runner.stop_recording(), Err(Error::Precondition(_))));
        f.runner.disconnect().unwrap();
        assert_eq!(f.runner.status().state, RunnerState::Disconnected);
    }

    #[test]
    fn test_trial_captures_only_recorded_window() {
        let f = fixture();
        f.runner.connect().unwrap();
        f.feed.push_constant(0.1, 10);

        f.runner.start_recording().unwrap();
        f.feed.push_constant(0.2, 10);
        f.runner.stimulate(0.0, Some(20.0), None).unwrap();
        f.feed.push_constant(0.3, 10);
        f.runner.stop_recording().unwrap();
        f.feed.push_constant(0.4, 10);

        let trial = f.runner.last_trial().unwrap();
        assert_eq!(trial.kinematics().len(), 2);
        assert_eq!(trial.stimulation().len(), 1);
        assert!(!trial.stimulation().events()[0].is_open());
        assert_eq!(trial.stimulation().events()[0].amplitudes, vec![20.0; 8]);
        assert!(!f.runner.status().stimulating);

        let continuous = f.runner.fetch_continuous(true);
        assert_eq!(continuous.kinematics().len(), 4);
    }

    #[test]
    fn test_stimulate_requires_connection_and_valid_duration() {
        let f = fixture();
        assert!(matches!(f.runner.stimulate(1.0, None, None), Err(Error::Precondition(_))));
        f.runner.connect().unwrap();
        assert!(matches!(f.runner.stimulate(-1.0, None, None), Err(Error::MalformedInput(_))));
        assert!(matches!(
            f.runner.stimulate(1.0, Some(1000.0), None),
            Err(Error::MalformedInput(_))
        ));

        f.runner.stimulate(0.5, None, Some(200.0)).unwrap();
        assert!(f.runner.status().stimulating);
        assert_eq!(f.stimulator.last_start(), Some(vec![50.0; 8]));
        assert_eq!(f.runner.stimulator().pulse_widths(), vec![200.0; 8]);
        f.runner.stop_stimulation().unwrap();
        assert!(!f.runner.status().stimulating);
    }

    #[test]
    fn test_incremental_fetch() {
        let f = fixture();
        f.runner.connect().unwrap();
        f.feed.push_constant(0.1, 5);
        f.feed.push_constant(0.2, 5);

        assert_eq!(f.runner.fetch_continuous(false).kinematics().len(), 2);
        assert!(!f.runner.fetch_continuous(false).has_data());
        assert_eq!(f.runner.fetch_continuous(true).kinematics().len(), 2);

        f.feed.push_constant(0.3, 5);
        f.runner.start_fetch();
        assert!(!f.runner.fetch_continuous(false).has_data());
    }

    #[test]
    fn test_schedule_and_unschedule() {
        let f = fixture();
        assert_eq!(f.runner.templates().len(), 1);
        assert!(matches!(f.runner.schedule(4, Side::Left), Err(Error::MalformedInput(_))));

        let ids = f.runner.schedule(0, Side::Both).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(f.runner.scheduled_rules().unwrap().len(), 2);

        let removed = f.runner.unschedule(0).unwrap();
        assert!(removed.name.ends_with("left"));
        assert_eq!(f.runner.scheduled_rules().unwrap().len(), 1);
        assert!(matches!(f.runner.unschedule(5), Err(Error::MalformedInput(_))));
    }

    #[test]
    fn test_save_trial_to_trials_dir() {
        let f = fixture();
        assert!(matches!(f.runner.save_trial(Path::new("t.json")), Err(Error::Precondition(_))));

        f.runner.connect().unwrap();
        f.runner.start_recording().unwrap();
        f.feed.push_constant(0.5, 4);
        f.runner.stop_recording().unwrap();

        let path = f.runner.save_trial(Path::new("day1/t.json")).unwrap();
        assert!(path.exists());
        let restored = Session::load(&path).unwrap();
        assert_eq!(restored.kinematics().time(), f.runner.last_trial().unwrap().kinematics().time());
        f.runner.plot_trial().unwrap();
    }

    #[test]
    fn test_teardown_returns_to_idle() {
        let f = fixture();
        f.runner.connect().unwrap();
        f.runner.start_recording().unwrap();
        f.runner.stimulate(0.0, None, None).unwrap();

        f.runner.teardown();
        let status = f.runner.status();
        assert_eq!(status.state, RunnerState::Disconnected);
        assert!(!status.stimulating);

        f.runner.connect().unwrap();
    }

    /// Restarts every 50 ms while the left leg is past 60% of its stride.
    fn pulsing_template() -> RuleTemplate {
        RuleTemplate::Declarative(RuleDescription {
            name: "left pulses".to_string(),
            description: None,
            pulse: PulseDescription {
                channels: vec![0],
                amplitudes: vec![10.0],
            },
            start_stimulating_rule: Some(ConditionDescription {
                gait_percentage: Some(0.6),
                side: Some(Side::Left),
                comparison: Some(Comparison::GreaterOrEqual),
                ..Default::default()
            }),
            continue_stimulating_rule: None,
            end_stimulating_rule: Some(ConditionDescription {
                duration: Some(0.05),
                comparison: Some(Comparison::GreaterOrEqual),
                ..Default::default()
            }),
        })
    }

    fn start_count(stimulator: &FakeStimulatorHandle) -> usize {
        stimulator
            .calls()
            .iter()
            .filter(|call| matches!(call, StimulatorCall::Start(_)))
            .count()
    }

    #[test]
    fn test_rules_idle_while_disconnected() {
        let f = fixture_with(vec![pulsing_template()]);
        f.runner.schedule(0, Side::Left).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(start_count(&f.stimulator), 0);

        f.runner.connect().unwrap();
        f.feed.push_constant(-0.8, 5);
        f.feed.push_constant(-0.9, 5);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while start_count(&f.stimulator) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(start_count(&f.stimulator) >= 2);

        f.runner.disconnect().unwrap();
        let starts = start_count(&f.stimulator);
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert_eq!(start_count(&f.stimulator), starts);
        assert!(!f.runner.status().stimulating);
        assert!(f.runner.scheduled_rules().unwrap().iter().all(|rule| !rule.stimulating));
    }
}
