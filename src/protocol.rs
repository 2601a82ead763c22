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

//! Command protocol shared by the TCP server and the local console.
//!
//! A request reads `<opcode>[:<p1>,<p2>,...]`. Parameters are checked against
//! the command arity before the runner is touched; every request produces one
//! [`Ack`] and optionally a JSON payload for the data channel.

use std::fmt;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::runner::Runner;
use crate::shared_types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Disconnect,
    StartRecording,
    StopRecording,
    Stimulate,
    ListTemplates,
    AddRule,
    GetRules,
    RemoveRule,
    StartFetch,
    Fetch,
    Plot,
    Save,
    Quit,
    Shutdown,
}

const COMMANDS: [Command; 15] = [
    Command::Connect,
    Command::Disconnect,
    Command::StartRecording,
    Command::StopRecording,
    Command::Stimulate,
    Command::ListTemplates,
    Command::AddRule,
    Command::GetRules,
    Command::RemoveRule,
    Command::StartFetch,
    Command::Fetch,
    Command::Plot,
    Command::Save,
    Command::Quit,
    Command::Shutdown,
];

impl Command {
    pub fn all() -> &'static [Command] {
        &COMMANDS
    }

    pub fn from_opcode(opcode: u32) -> Option<Self> {
        COMMANDS.get(opcode as usize).copied()
    }

    pub fn opcode(self) -> u32 {
        self as u32
    }

    /// Name typed at the local console
    pub fn console_name(self) -> &'static str {
        match self {
            Command::Connect => "start_nidaq",
            Command::Disconnect => "stop_nidaq",
            Command::StartRecording => "start",
            Command::StopRecording => "stop",
            Command::Stimulate => "stim",
            Command::ListTemplates => "available_stim",
            Command::AddRule => "schedule_stim",
            Command::GetRules => "scheduled_stim",
            Command::RemoveRule => "unschedule_stim",
            Command::StartFetch => "start_fetch",
            Command::Fetch => "fetch_data",
            Command::Plot => "plot",
            Command::Save => "save",
            Command::Quit => "quit",
            Command::Shutdown => "shutdown",
        }
    }

    pub fn from_console_name(name: &str) -> Option<Self> {
        COMMANDS.iter().copied().find(|command| command.console_name() == name)
    }

    /// Accepted parameter count, inclusive
    pub fn arity(self) -> (usize, usize) {
        match self {
            Command::Stimulate => (1, 3),
            Command::AddRule => (1, 2),
            Command::RemoveRule | Command::Save => (1, 1),
            Command::Fetch => (0, 1),
            _ => (0, 0),
        }
    }

    pub fn usage(self) -> &'static str {
        match self {
            Command::Connect => "connect the acquisition device",
            Command::Disconnect => "disconnect the acquisition device",
            Command::StartRecording => "start recording a trial",
            Command::StopRecording => "stop recording the trial",
            Command::Stimulate => "stimulate for <duration>[,<amplitude>[,<pulse width>]], duration 0 until stopped",
            Command::ListTemplates => "list the stimulation rule templates",
            Command::AddRule => "schedule template <index>[,<side: 0 left, 1 right, 2 both>]",
            Command::GetRules => "list the scheduled rules",
            Command::RemoveRule => "unschedule rule <index>",
            Command::StartFetch => "start incremental fetching of continuous data",
            Command::Fetch => "fetch continuous data since last fetch, [<from top: 0|1>]",
            Command::Plot => "summarize the last trial",
            Command::Save => "save the last trial to <filename>",
            Command::Quit => "close the session",
            Command::Shutdown => "close the session and stop the server",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.console_name(), self.opcode())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub command: Command,
    pub params: Vec<String>,
}

impl Request {
    pub fn new(command: Command, params: Vec<String>) -> Self {
        Self { command, params }
    }

    /// Parses `<opcode>[:<p1>,<p2>,...]`.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (opcode, params) = text.split_once(':').unwrap_or((text, ""));
        let opcode: u32 = opcode
            .trim()
            .parse()
            .map_err(|_| Error::malformed(format!("invalid opcode '{opcode}'")))?;
        let command =
            Command::from_opcode(opcode).ok_or_else(|| Error::malformed(format!("unknown opcode {opcode}")))?;
        Ok(Self::new(command, split_params(params)))
    }

    /// Parses a console line: `<name> [<p1>,<p2>,...]`.
    pub fn parse_console(line: &str) -> Result<Self> {
        let line = line.trim();
        let (name, params) = line
            .split_once(char::is_whitespace)
            .unwrap_or((line, ""));
        let command = Command::from_console_name(name)
            .ok_or_else(|| Error::malformed(format!("unknown command '{name}'")))?;
        Ok(Self::new(command, split_params(params)))
    }

    fn check_arity(&self) -> Result<()> {
        let (min, max) = self.command.arity();
        if self.params.len() < min || self.params.len() > max {
            return Err(Error::malformed(format!(
                "{} takes {}..={} parameters, got {}",
                self.command,
                min,
                max,
                self.params.len()
            )));
        }
        Ok(())
    }

    fn number(&self, index: usize, what: &str) -> Result<Option<f64>> {
        self.params
            .get(index)
            .map(|param| {
                param
                    .parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite())
                    .ok_or_else(|| Error::malformed(format!("{what} must be a number, got '{param}'")))
            })
            .transpose()
    }

    fn index(&self, index: usize, what: &str) -> Result<Option<usize>> {
        self.params
            .get(index)
            .map(|param| {
                param
                    .parse::<usize>()
                    .map_err(|_| Error::malformed(format!("{what} must be a non-negative integer, got '{param}'")))
            })
            .transpose()
    }

    fn flag(&self, index: usize) -> Result<bool> {
        match self.params.get(index).map(String::as_str) {
            None | Some("0") | Some("false") | Some("False") => Ok(false),
            Some("1") | Some("true") | Some("True") => Ok(true),
            Some(other) => Err(Error::malformed(format!("expected a boolean, got '{other}'"))),
        }
    }
}

fn split_params(params: &str) -> Vec<String> {
    let params = params.trim();
    if params.is_empty() {
        return Vec::new();
    }
    params.split(',').map(|param| param.trim().to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Error,
}

impl Ack {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Ack::Ok => b"OK",
            Ack::Error => b"ERROR",
        }
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ack::Ok => write!(f, "OK"),
            Ack::Error => write!(f, "ERROR"),
        }
    }
}

/// What the connection loop does after acknowledging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub ack: Ack,
    /// Sent on the data channel before the acknowledgment
    pub payload: Option<Value>,
    pub flow: Flow,
}

impl Outcome {
    fn ok(payload: Option<Value>, flow: Flow) -> Self {
        Self {
            ack: Ack::Ok,
            payload,
            flow,
        }
    }

    pub fn error() -> Self {
        Self {
            ack: Ack::Error,
            payload: None,
            flow: Flow::Continue,
        }
    }
}

#[derive(Debug, Serialize)]
struct IndexedRule {
    index: usize,
    #[serde(flatten)]
    rule: crate::rule::RuleInfo,
}

/// Parses and runs one protocol line.
pub fn handle_line(runner: &Runner, line: &str) -> Outcome {
    match Request::parse(line) {
        Ok(request) => dispatch(runner, &request),
        Err(e) => {
            warn!("Rejected request '{}': {}", line.trim(), e);
            Outcome::error()
        }
    }
}

/// Runs `request` against the runner; failures become an `ERROR` acknowledgment.
pub fn dispatch(runner: &Runner, request: &Request) -> Outcome {
    debug!("Dispatching {} with {:?}", request.command, request.params);
    match execute(runner, request) {
        Ok(outcome) => {
            info!("{} -> OK", request.command);
            outcome
        }
        Err(e) => {
            warn!("{} -> ERROR: {}", request.command, e);
            Outcome::error()
        }
    }
}

fn execute(runner: &Runner, request: &Request) -> Result<Outcome> {
    request.check_arity()?;

    let payload = match request.command {
        Command::Connect => {
            runner.connect()?;
            Some(serde_json::to_value(runner.device_info())?)
        }
        Command::Disconnect => {
            runner.disconnect()?;
            None
        }
        Command::StartRecording => {
            runner.start_recording()?;
            None
        }
        Command::StopRecording => {
            runner.stop_recording()?;
            None
        }
        Command::Stimulate => {
            let duration = request.number(0, "duration")?.unwrap_or(0.0);
            let amplitude = request.number(1, "amplitude")?;
            let pulse_width = request.number(2, "pulse width")?;
            runner.stimulate(duration, amplitude, pulse_width)?;
            None
        }
        Command::ListTemplates => Some(serde_json::to_value(runner.templates())?),
        Command::AddRule => {
            let index = request.index(0, "template index")?.unwrap_or(0);
            let side = match request.params.get(1) {
                Some(side) => Side::from_index(
                    side.parse()
                        .map_err(|_| Error::malformed(format!("side must be 0, 1 or 2, got '{side}'")))?,
                )?,
                None => Side::Both,
            };
            runner.schedule(index, side)?;
            None
        }
        Command::GetRules => {
            let rules: Vec<IndexedRule> = runner
                .scheduled_rules()?
                .into_iter()
                .enumerate()
                .map(|(index, rule)| IndexedRule { index, rule })
                .collect();
            Some(serde_json::to_value(rules)?)
        }
        Command::RemoveRule => {
            let index = request.index(0, "rule index")?.unwrap_or(0);
            runner.unschedule(index)?;
            None
        }
        Command::StartFetch => {
            runner.start_fetch();
            None
        }
        Command::Fetch => {
            let from_top = request.flag(0)?;
            Some(serde_json::to_value(runner.fetch_continuous(from_top).to_snapshot())?)
        }
        Command::Plot => {
            runner.plot_trial()?;
            None
        }
        Command::Save => {
            let filename = &request.params[0];
            if filename.is_empty() {
                return Err(Error::malformed("empty filename"));
            }
            runner.save_trial(Path::new(filename))?;
            None
        }
        Command::Quit => return Ok(Outcome::ok(None, Flow::Quit)),
        Command::Shutdown => return Ok(Outcome::ok(None, Flow::Shutdown)),
    };

    Ok(Outcome::ok(payload, Flow::Continue))
}
