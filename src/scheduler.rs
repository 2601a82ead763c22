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

//! Automatic stimulation scheduler.
//!
//! The [`Scheduler`] owns its [`RuleSet`] on a dedicated thread; callers talk to
//! it through a command channel. Every cycle the rules are evaluated against the
//! gait phase of the continuous session and their decisions are merged into one
//! amplitude vector (`None` leaves a channel untouched) which is pushed to the
//! stimulator in a single call.
//!
//! Two rules writing the same channel in the same cycle resolve to the one
//! registered last, since rules are evaluated in registration order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::actuator::Stimulator;
use crate::error::{Error, Result};
use crate::gait_phase::{is_available, percentage_of_stride};
use crate::rule::{Decision, RuleInfo, StimulationRule};
use crate::session::Session;
use crate::shared_types::{SchedulerMetrics, Side};
use crate::timebase::seconds_between;

/// How long the idle loop waits for a command when there is nothing to evaluate.
const IDLE_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleId(u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Active rules, kept in registration order.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: BTreeMap<RuleId, StimulationRule>,
}

/// Result of evaluating every rule once.
#[derive(Debug)]
pub struct CycleOutcome {
    pub amplitudes: Vec<Option<f64>>,
    pub failures: Vec<(RuleId, Error)>,
}

impl CycleOutcome {
    pub fn has_changes(&self) -> bool {
        self.amplitudes.iter().any(Option::is_some)
    }
}

impl RuleSet {
    pub fn insert(&mut self, id: RuleId, rule: StimulationRule) {
        self.rules.insert(id, rule);
    }

    pub fn remove(&mut self, id: RuleId) -> Option<StimulationRule> {
        self.rules.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Clears the stimulating state of every rule.
    pub fn reset(&mut self) {
        for rule in self.rules.values_mut() {
            rule.reset();
        }
    }

    pub fn infos(&self) -> Vec<(RuleId, RuleInfo)> {
        self.rules.iter().map(|(id, rule)| (*id, rule.info())).collect()
    }

    /// Evaluates every rule and merges their decisions channel by channel.
    ///
    /// A failing rule is reported in the outcome and contributes nothing; the
    /// other rules still apply.
    pub fn evaluate(&mut self, session_time: f64, left: f64, right: f64, channel_count: usize) -> CycleOutcome {
        let mut outcome = CycleOutcome {
            amplitudes: vec![None; channel_count],
            failures: Vec::new(),
        };

        for (id, rule) in self.rules.iter_mut() {
            match rule.evaluate(session_time, left, right) {
                Ok(Decision::StartAt(amplitudes)) => {
                    debug!("Rule {} '{}' starts stimulating", id, rule.name());
                    merge(&mut outcome.amplitudes, rule.channels(), amplitudes.iter().copied());
                }
                Ok(Decision::Stop) => {
                    debug!("Rule {} '{}' stops stimulating", id, rule.name());
                    merge(
                        &mut outcome.amplitudes,
                        rule.channels(),
                        std::iter::repeat(0.0),
                    );
                }
                Ok(Decision::Continue | Decision::NoChange) => {}
                Err(e) => outcome.failures.push((*id, e)),
            }
        }
        outcome
    }
}

fn merge(merged: &mut [Option<f64>], channels: &[usize], amplitudes: impl Iterator<Item = f64>) {
    for (channel, amplitude) in channels.iter().zip(amplitudes) {
        if let Some(slot) = merged.get_mut(*channel) {
            *slot = Some(amplitude);
        }
    }
}

enum SchedulerCommand {
    Add(RuleId, StimulationRule),
    Remove(RuleId, Sender<Option<RuleInfo>>),
    List(Sender<Vec<(RuleId, RuleInfo)>>),
    Reset(Sender<()>),
    Barrier(Sender<()>),
}

/// Handle on the scheduling thread.
pub struct Scheduler {
    commands: Sender<SchedulerCommand>,
    paused: Arc<AtomicBool>,
    exit: Arc<AtomicBool>,
    metrics: Arc<Mutex<SchedulerMetrics>>,
    next_id: AtomicU64,
    channel_count: usize,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawns the scheduling thread over `session`, driving `stimulator`.
    pub fn start(session: Arc<RwLock<Session>>, stimulator: Stimulator) -> Result<Self> {
        let (commands, inbox) = channel::unbounded();
        let paused = Arc::new(AtomicBool::new(false));
        let exit = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(Mutex::new(SchedulerMetrics::default()));
        let channel_count = stimulator.channel_count();

        let worker = SchedulerWorker {
            rules: RuleSet::default(),
            inbox,
            session,
            stimulator,
            paused: Arc::clone(&paused),
            exit: Arc::clone(&exit),
            metrics: Arc::clone(&metrics),
        };
        let handle = thread::Builder::new()
            .name("stimulation-scheduler".to_string())
            .spawn(move || worker.run())?;

        info!("Scheduler started for {} stimulation channels", channel_count);
        Ok(Scheduler {
            commands,
            paused,
            exit,
            metrics,
            next_id: AtomicU64::new(1),
            channel_count,
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn add(&self, rule: StimulationRule) -> Result<RuleId> {
        if let Some(channel) = rule.highest_channel().filter(|channel| *channel >= self.channel_count) {
            return Err(Error::configuration(format!(
                "rule '{}' targets channel {} but the stimulator has {} channels",
                rule.name(),
                channel,
                self.channel_count
            )));
        }

        let id = RuleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!("Scheduling rule {} '{}'", id, rule.name());
        self.send(SchedulerCommand::Add(id, rule))?;
        Ok(id)
    }

    /// Removes a rule, returning its last state, or `None` for an unknown id.
    pub fn remove(&self, id: RuleId) -> Result<Option<RuleInfo>> {
        let (reply, response) = channel::bounded(1);
        self.send(SchedulerCommand::Remove(id, reply))?;
        response.recv().map_err(|_| Error::precondition("scheduler is disposed"))
    }

    pub fn list(&self) -> Result<Vec<(RuleId, RuleInfo)>> {
        let (reply, response) = channel::bounded(1);
        self.send(SchedulerCommand::List(reply))?;
        response.recv().map_err(|_| Error::precondition("scheduler is disposed"))
    }

    /// Stops evaluating rules. Once this returns, no cycle is in flight.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        if self.round_trip(SchedulerCommand::Barrier).is_err() {
            // A disposed scheduler runs no cycle anyway
            return;
        }
        debug!("Scheduler paused");
    }

    /// Forgets every rule's ongoing stimulation without touching the stimulator.
    pub fn reset_rules(&self) {
        if self.round_trip(SchedulerCommand::Reset).is_ok() {
            debug!("Scheduled rules reset");
        }
    }

    pub fn resume(&self) {
        debug!("Scheduler resumed");
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.lock().clone()
    }

    /// Stops the thread; no stimulator call happens once this returns. Idempotent.
    pub fn dispose(&self) {
        self.exit.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!("Scheduler thread panicked");
            }
            info!("Scheduler disposed");
        }
    }

    /// Sends a command and waits until the worker has handled it.
    fn round_trip(&self, command: fn(Sender<()>) -> SchedulerCommand) -> Result<()> {
        let (reply, response) = channel::bounded(1);
        self.send(command(reply))?;
        response.recv().map_err(|_| Error::precondition("scheduler is disposed"))
    }

    fn send(&self, command: SchedulerCommand) -> Result<()> {
        if self.exit.load(Ordering::SeqCst) {
            return Err(Error::precondition("scheduler is disposed"));
        }
        self.commands
            .send(command)
            .map_err(|_| Error::precondition("scheduler is disposed"))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct SchedulerWorker {
    rules: RuleSet,
    inbox: Receiver<SchedulerCommand>,
    session: Arc<RwLock<Session>>,
    stimulator: Stimulator,
    paused: Arc<AtomicBool>,
    exit: Arc<AtomicBool>,
    metrics: Arc<Mutex<SchedulerMetrics>>,
}

impl SchedulerWorker {
    fn run(mut self) {
        debug!("Scheduler thread running");

        while !self.exit.load(Ordering::SeqCst) {
            if self.paused.load(Ordering::SeqCst) || self.rules.is_empty() {
                match self.inbox.recv_timeout(IDLE_POLL) {
                    Ok(command) => self.handle(command),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            }

            while let Ok(command) = self.inbox.try_recv() {
                self.handle(command);
            }
            // A pause acknowledged while draining must not be followed by a cycle
            if !self.rules.is_empty() && !self.paused.load(Ordering::SeqCst) && !self.exit.load(Ordering::SeqCst) {
                self.cycle();
            }
            thread::yield_now();
        }

        debug!("Scheduler thread exiting with {} rules", self.rules.len());
    }

    fn handle(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Add(id, rule) => self.rules.insert(id, rule),
            SchedulerCommand::Remove(id, reply) => {
                let removed = self.rules.remove(id);
                if let Some(rule) = removed.as_ref().filter(|rule| rule.is_stimulating()) {
                    // Channels left on by the removed rule are switched off
                    let mut amplitudes = vec![None; self.stimulator.channel_count()];
                    merge(&mut amplitudes, rule.channels(), std::iter::repeat(0.0));
                    self.apply(&amplitudes);
                }
                // The caller may have given up waiting
                let _ = reply.send(removed.map(|rule| rule.info()));
            }
            SchedulerCommand::List(reply) => {
                let _ = reply.send(self.rules.infos());
            }
            SchedulerCommand::Reset(reply) => {
                self.rules.reset();
                let _ = reply.send(());
            }
            SchedulerCommand::Barrier(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn cycle(&mut self) {
        self.metrics.lock().cycles += 1;

        let (origin, left, right) = {
            let session = self.session.read();
            (
                session.origin(),
                percentage_of_stride(session.kinematics(), Side::Left),
                percentage_of_stride(session.kinematics(), Side::Right),
            )
        };
        if !is_available(left) || !is_available(right) {
            return;
        }

        let session_time = seconds_between(origin, Utc::now());
        let outcome = self
            .rules
            .evaluate(session_time, left, right, self.stimulator.channel_count());
        trace!("Cycle at {:.4}s: left {:.3}, right {:.3}", session_time, left, right);

        {
            let mut metrics = self.metrics.lock();
            metrics.evaluated_cycles += 1;
            metrics.rule_failures += outcome.failures.len() as u64;
        }
        for (id, e) in &outcome.failures {
            warn!("Rule {} skipped this cycle: {}", id, e);
        }

        if outcome.has_changes() {
            self.apply(&outcome.amplitudes);
        }
    }

    /// Pushes the merged vector, then starts or pauses depending on what is left on.
    fn apply(&self, amplitudes: &[Option<f64>]) {
        if let Err(e) = self.stimulator.update_amplitudes(amplitudes) {
            warn!("Failed to update stimulation amplitudes: {}", e);
            self.metrics.lock().device_failures += 1;
            return;
        }
        self.metrics.lock().amplitude_commands += 1;

        let any_active = self.stimulator.amplitudes().iter().any(|amplitude| *amplitude > 0.0);
        let result = if any_active {
            self.stimulator.start_stimulation(None)
        } else {
            self.stimulator.pause_stimulation()
        };
        if let Err(e) = result {
            warn!("Stimulator rejected scheduled command: {}", e);
            self.metrics.lock().device_failures += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{FakeStimulatorBackend, FakeStimulatorHandle, StimulatorCall};
    use crate::config::StimulatorConfig;
    use crate::rule::RuleTemplate;
    use crate::timebase::SampleBlock;
    use std::time::Instant;

    fn rule(name: &str, channels: Vec<usize>, amplitude: f64) -> StimulationRule {
        let count = channels.len();
        StimulationRule::builder(name)
            .channels(channels)
            .amplitudes(vec![amplitude; count])
            .start(|_, left, _| Ok(left >= 0.6))
            .continue_while(|_, left, _| Ok(left >= 0.6))
            .build()
            .unwrap()
    }

    #[test]
    fn test_disjoint_rules_merge() {
        let mut rules = RuleSet::default();
        rules.insert(RuleId(1), rule("a", vec![0, 1], 10.0));
        rules.insert(RuleId(2), rule("b", vec![3], 20.0));

        let outcome = rules.evaluate(0.0, 0.7, 0.0, 5);
        assert_eq!(outcome.amplitudes, vec![Some(10.0), Some(10.0), None, Some(20.0), None]);
        assert!(outcome.failures.is_empty());
    }

    #[test]
    fn test_same_channel_last_registered_wins() {
        let mut rules = RuleSet::default();
        rules.insert(RuleId(1), rule("first", vec![2], 10.0));
        rules.insert(RuleId(2), rule("second", vec![2], 30.0));

        let outcome = rules.evaluate(0.0, 0.7, 0.0, 4);
        assert_eq!(outcome.amplitudes[2], Some(30.0));
    }

    #[test]
    fn test_failing_rule_is_skipped() {
        let mut rules = RuleSet::default();
        let broken = StimulationRule::builder("broken")
            .channels(vec![0])
            .amplitudes(vec![5.0])
            .start(|_, _, _| Err(Error::malformed("boom")))
            .end(|_, _, _| Ok(true))
            .build()
            .unwrap();
        rules.insert(RuleId(1), broken);
        rules.insert(RuleId(2), rule("ok", vec![1], 12.0));

        let outcome = rules.evaluate(0.0, 0.7, 0.0, 2);
        assert_eq!(outcome.amplitudes, vec![None, Some(12.0)]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].0, RuleId(1));
    }

    #[test]
    fn test_stop_zeroes_only_rule_channels() {
        let mut rules = RuleSet::default();
        rules.insert(RuleId(1), rule("a", vec![1], 10.0));
        rules.evaluate(0.0, 0.7, 0.0, 3);
        let outcome = rules.evaluate(0.1, 0.2, 0.0, 3);
        assert_eq!(outcome.amplitudes, vec![None, Some(0.0), None]);
    }

    /// Continuous session whose last two blocks put the left leg at 0.7 and the right at 0.225.
    fn swing_session() -> Arc<RwLock<Session>> {
        let mut session = Session::default();
        let origin = session.origin();
        for (index, mean) in [-0.8, -0.9].into_iter().enumerate() {
            let first = index as f64 * 0.1;
            let block = SampleBlock::from_rows(vec![first, first + 0.05], &[vec![mean, mean]]).unwrap();
            session.kinematics_mut().add_block_at(origin, block).unwrap();
        }
        Arc::new(RwLock::new(session))
    }

    fn fake_stimulator() -> (Stimulator, FakeStimulatorHandle) {
        let (backend, handle) = FakeStimulatorBackend::new(8);
        let stimulator = Stimulator::new(Box::new(backend), &StimulatorConfig::default()).unwrap();
        (stimulator, handle)
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_scheduler_drives_stimulator() {
        let (stimulator, handle) = fake_stimulator();
        let scheduler = Scheduler::start(swing_session(), stimulator.clone()).unwrap();

        let rules = RuleTemplate::SwingPhase { amplitude: 40.0 }
            .instantiate(Side::Left)
            .unwrap();
        for rule in rules {
            scheduler.add(rule).unwrap();
        }

        assert!(wait_for(|| handle.last_start().is_some()));
        let started = handle.last_start().unwrap();
        assert_eq!(&started[..4], &[40.0; 4]);
        assert_eq!(&started[4..], &[0.0; 4]);
        assert!(stimulator.is_stimulating());

        let listed = scheduler.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].1.stimulating);

        let removed = scheduler.remove(listed[0].0).unwrap();
        assert!(removed.is_some());
        assert_eq!(handle.calls().last(), Some(&StimulatorCall::Pause));
        assert!(scheduler.remove(listed[0].0).unwrap().is_none());

        scheduler.dispose();
        assert!(scheduler.metrics().evaluated_cycles >= 1);
    }

    #[test]
    fn test_rule_beyond_channel_count_is_rejected() {
        let (backend, _handle) = FakeStimulatorBackend::new(2);
        let stimulator = Stimulator::new(Box::new(backend), &StimulatorConfig::default()).unwrap();
        let scheduler = Scheduler::start(swing_session(), stimulator).unwrap();
        assert!(matches!(
            scheduler.add(rule("wide", vec![0, 5], 10.0)),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_unavailable_phase_skips_evaluation() {
        let (stimulator, handle) = fake_stimulator();
        let session = Arc::new(RwLock::new(Session::default()));
        let scheduler = Scheduler::start(session, stimulator).unwrap();
        scheduler.add(rule("a", vec![0], 10.0)).unwrap();

        assert!(wait_for(|| scheduler.metrics().cycles > 10));
        assert_eq!(scheduler.metrics().evaluated_cycles, 0);
        assert!(handle.calls().is_empty());
    }

    #[test]
    fn test_no_hardware_calls_after_dispose() {
        let (stimulator, handle) = fake_stimulator();
        let scheduler = Scheduler::start(swing_session(), stimulator).unwrap();
        scheduler.add(rule("a", vec![0], 10.0)).unwrap();
        assert!(wait_for(|| handle.call_count() > 0));

        scheduler.dispose();
        scheduler.dispose();
        let calls = handle.call_count();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(handle.call_count(), calls);
        assert!(matches!(scheduler.add(rule("late", vec![0], 1.0)), Err(Error::Precondition(_))));
    }

    #[test]
    fn test_paused_scheduler_does_not_evaluate() {
        let (stimulator, handle) = fake_stimulator();
        let scheduler = Scheduler::start(swing_session(), stimulator).unwrap();
        scheduler.pause();
        scheduler.add(rule("a", vec![0], 10.0)).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(handle.calls().is_empty());

        scheduler.resume();
        assert!(wait_for(|| handle.last_start().is_some()));
    }

    #[test]
    fn test_pause_waits_for_running_cycle_and_reset_clears_rules() {
        let (stimulator, handle) = fake_stimulator();
        let scheduler = Scheduler::start(swing_session(), stimulator).unwrap();
        scheduler.add(rule("a", vec![0], 10.0)).unwrap();
        assert!(wait_for(|| handle.last_start().is_some()));

        scheduler.pause();
        let cycles = scheduler.metrics().cycles;
        scheduler.reset_rules();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(scheduler.metrics().cycles, cycles);
        assert!(scheduler.list().unwrap().iter().all(|(_, info)| !info.stimulating));
    }
}
