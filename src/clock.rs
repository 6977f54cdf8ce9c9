// mcpOS: featherweight embedded Model Context Protocol runtime.
//
// Copyright (C) 2020  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

use std::time::Instant;

// Wrapper around somewhat obnoxious system time api.
//
// Everything in the runtime keys off a monotonic millisecond count;
// wall-clock time never enters the core.
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            origin: Instant::now(),
        }
    }

    // Milliseconds since the clock was created.
    pub fn now_ms(&self) -> u64 {
        let e = self.origin.elapsed();
        (e.as_secs() * 1000) + u64::from(e.subsec_millis())
    }
}
