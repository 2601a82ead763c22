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

//! Local text console over the same dispatch as the TCP server.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::protocol::{self, Command, Flow, Request};
use crate::runner::Runner;

const PROMPT: &str = "stimwalker> ";

/// Reads commands from `input` until `quit`, `shutdown` or end of input.
pub fn run_console<R, W>(runner: &Runner, input: R, mut output: W) -> Result<()>
where
    R: BufRead,
    W: Write,
{
    info!("Console ready, type 'list' for the available commands");
    write!(output, "{PROMPT}")?;
    output.flush()?;

    for line in input.lines() {
        let line = line.context("Failed to read console input")?;
        let line = line.trim();

        if line == "list" {
            print_help(&mut output)?;
        } else if !line.is_empty() {
            match Request::parse_console(line) {
                Ok(request) => {
                    let outcome = protocol::dispatch(runner, &request);
                    if let Some(payload) = &outcome.payload {
                        writeln!(output, "{}", serde_json::to_string_pretty(payload)?)?;
                    }
                    writeln!(output, "{}", outcome.ack)?;
                    if outcome.flow != Flow::Continue {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Console input rejected: {}", e);
                    writeln!(output, "{e}")?;
                }
            }
        }

        write!(output, "{PROMPT}")?;
        output.flush()?;
    }

    writeln!(output)?;
    info!("Console closed");
    Ok(())
}

fn print_help<W: Write>(output: &mut W) -> Result<()> {
    writeln!(output, "{:<16} {}", "list", "show this help")?;
    for command in Command::all() {
        writeln!(output, "{:<16} {}", command.console_name(), command.usage())?;
    }
    Ok(())
}
