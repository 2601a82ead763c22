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

use thiserror::Error;

/// Failure taxonomy shared by the session core.
///
/// `Precondition` and `MalformedInput` are always recoverable by the caller;
/// `Device` wraps whatever the hardware backend reported; `Configuration` is
/// raised while building a stimulation rule, before it can reach the scheduler.
#[derive(Error, Debug)]
pub enum Error {
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("device failure: {0}")]
    Device(String),

    #[error("invalid rule configuration: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary encoding error: {0}")]
    Binary(#[from] bincode::Error),
}

impl Error {
    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Error::Precondition(message.into())
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedInput(message.into())
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    /// Wraps a backend error, keeping its context chain in the message.
    pub(crate) fn device(error: anyhow::Error) -> Self {
        Error::Device(format!("{error:#}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
