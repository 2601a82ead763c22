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

//! Stimwalker - closed-loop functional electrical stimulation for gait rehabilitation
//!
//! Kinematic blocks stream in from an acquisition device, a gait-phase estimate
//! is derived from them, and scheduled stimulation rules turn that estimate into
//! amplitude commands for the stimulator. A [`Runner`] owns one such setup and is
//! driven either over TCP ([`IpcServer`]) or from a local console.

pub mod actuator;
pub mod config;
pub mod console;
pub mod error;
pub mod gait_phase;
pub mod ipc_server;
pub mod observers;
pub mod protocol;
pub mod rule;
pub mod runner;
pub mod scheduler;
pub mod sensor;
pub mod session;
pub mod shared_types;
pub mod stimulation_events;
pub mod timebase;

pub use error::{Error, Result};
pub use ipc_server::IpcServer;
pub use runner::{Runner, RunnerConfig};
pub use session::Session;
