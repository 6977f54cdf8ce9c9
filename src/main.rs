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

use std::{env::args, thread, time::Duration};

use serde_json::json;

use mcpos::config::{self, SystemConfig};
use mcpos::event::EventKind;
use mcpos::scheduler::Priority;
use mcpos::system::System;

fn main() {
    let config = match args().nth(1) {
        Some(path) => config::load(&path).expect("couldn't load config"),
        None => SystemConfig::default(),
    };

    let mut system = System::init(config).expect("system init failed");

    // Install a small composite capability and a rule that invokes
    // it on a schedule, then run a few ticks to show the loop.
    let defined = system.execute_tool(&json!({
        "tool": "system.defineTool",
        "params": {
            "name": "demo.hello",
            "description": "log a greeting",
            "implementationType": "composite",
            "implementation": {
                "steps": [
                    {"tool": "system.log",
                     "params": "{\"message\":\"hello from {{who}}\"}"},
                ],
            },
        },
    }));
    println!("define: {}", defined.body);

    system.create_rule(&json!({
        "id": "heartbeat",
        "triggers": [{"type": "schedule", "intervalMs": 100}],
        "actions": [{"type": "tool", "tool": "demo.hello",
                     "params": {"who": "the automation engine"}}],
    })).expect("couldn't create rule");

    system.schedule(
        Box::new(|| println!("tick")),
        100,
        Priority::Normal
    ).expect("couldn't schedule task");

    for _ in 0..3 {
        system.publish(EventKind::Timer, None, b"").ok();
        let report = system.process();
        println!("tick report: {:?}", report);
        thread::sleep(Duration::from_millis(100));
    }

    println!("tools: {}", system.tool_list());
    system.deinit();
}
