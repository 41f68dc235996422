// Copyright (c) 2025 The RANMARK Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error type for marking operations.

use strum_macros::EnumIter;

/// An error produced while processing packets, radio feedback or bearer
/// configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, EnumIter)]
pub enum Error {
    /// The packet is too short for the headers it announces, or a header
    /// field carries a value the decoder cannot accept.
    #[default]
    MalformedPacket,

    /// The IPv4 payload is neither TCP nor UDP. The packet is forwarded
    /// unmodified.
    UnsupportedProtocol,

    /// A downlink SDU arrived for a QoS flow that has no DRB mapping. This
    /// is a configuration error and is surfaced to the caller.
    UnknownQosFlow,

    /// An operation referenced a DRB that was never added to the entity.
    UnknownBearer,

    /// A feedback sequence number is exactly half the sequence space away
    /// from the queue cursor, so it cannot be told apart from its own
    /// wrap-around image.
    SequenceWrapAmbiguous,

    /// The provided buffer is too short.
    BufferTooShort,

    /// The configuration is invalid.
    InvalidConfig(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
