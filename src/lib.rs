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

extern crate base64;
extern crate enumflags2;
extern crate log;
extern crate regex;
extern crate ron;
extern crate serde;
extern crate serde_json;
#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod util;
pub mod automation;
pub mod bytecode;
pub mod clock;
pub mod composite;
pub mod config;
pub mod event;
pub mod expr;
pub mod govern;
pub mod json;
pub mod logging;
pub mod memory;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod system;
pub mod tools;
pub mod value;
pub mod vm;
