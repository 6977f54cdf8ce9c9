// Automation engine.
//
// A rule pairs a trigger array with an action list. Triggers are
// OR-combined: any one firing runs every action, in order. Schedule
// and condition triggers are evaluated on the tick; event triggers
// fire through the bus hook (which only marks the rule pending --
// its actions run on the next tick, keeping all rule execution on
// the tick path); manual triggers fire only on explicit request.
//
// Action failures are logged and counted but never disable a rule,
// and a failing action does not stop the ones after it.
//
// Rules flagged persistent are snapshotted under rule.<id> and
// replayed by load_all at boot.

use std::collections::HashMap;
use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

use crate::event::Event;
use crate::storage::PersistentStore;
use crate::tools::ToolRegistry;
use crate::value::{Value, value_eq};


pub const RULE_KEY_PREFIX: &str = "rule.";

const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;


#[derive(Clone, Debug, PartialEq)]
pub enum AutomationError {
    ParseError(String),
    EmptyTriggers,
    EmptyActions,
    AlreadyExists,
    NotFound,
    Disabled,
    PersistFailed,
}

pub type Result<T> = core::result::Result<T, AutomationError>;


#[derive(Copy, Clone, Debug, PartialEq, Deserialize, Serialize)]
pub enum CompareOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "startsWith")]
    StartsWith,
    #[serde(rename = "endsWith")]
    EndsWith,
}


fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_level() -> String {
    String::from("info")
}

fn default_true() -> bool {
    true
}


#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TriggerSpec {
    #[serde(rename_all = "camelCase")]
    Condition {
        sensor: String,
        operator: CompareOp,
        value: Json,
        #[serde(default = "default_poll_interval")]
        poll_interval_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Event {
        event_type: String,
        #[serde(default)]
        source: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Schedule {
        interval_ms: u64,
    },
    Manual,
}


#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ActionSpec {
    Actuator {
        target: String,
        command: String,
        #[serde(default)]
        params: Json,
    },
    Tool {
        tool: String,
        #[serde(default)]
        params: Json,
    },
    Notification {
        message: String,
        #[serde(default = "default_level")]
        level: String,
        #[serde(default)]
        destination: String,
    },
    Custom {
        handler: String,
        #[serde(default)]
        params: Json,
    },
}


// Wire form of a complete rule, shared by create, the persistent
// snapshots, and export/import.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct RuleWire {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    persistent: bool,
    triggers: Vec<TriggerSpec>,
    actions: Vec<ActionSpec>,
}


struct Trigger {
    spec: TriggerSpec,
    last_check: u64,
    last_fired: u64,
}

struct Rule {
    id: String,
    name: String,
    description: String,
    triggers: Vec<Trigger>,
    actions: Vec<ActionSpec>,
    enabled: bool,
    persistent: bool,
    pending: bool,
}

impl Rule {
    fn to_wire(&self) -> RuleWire {
        RuleWire {
            id: Some(self.id.clone()),
            name: Some(self.name.clone()),
            description: Some(self.description.clone()),
            enabled: self.enabled,
            persistent: self.persistent,
            triggers: self.triggers.iter().map(|t| t.spec.clone()).collect(),
            actions: self.actions.clone(),
        }
    }
}


// Sensor reads for condition triggers; board drivers implement
// this outside the core.
pub trait SensorReader {
    fn read(&self, sensor: &str) -> Option<Value>;
}

pub struct NullSensors;

impl SensorReader for NullSensors {
    fn read(&self, _sensor: &str) -> Option<Value> {
        None
    }
}


// Actuator commands for actuator actions; same boundary.
pub trait ActuatorSink {
    fn command(
        &mut self,
        target: &str,
        command: &str,
        params: &Json
    ) -> core::result::Result<(), String>;
}

pub struct LogActuators;

impl ActuatorSink for LogActuators {
    fn command(
        &mut self,
        target: &str,
        command: &str,
        params: &Json
    ) -> core::result::Result<(), String> {
        info!("actuator {}: {} {}", target, command, params);
        Ok(())
    }
}


pub type CustomHandler = Box<dyn FnMut(&Json) -> bool>;


#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ProcessReport {
    pub rules_fired: usize,
    pub actions_failed: usize,
}


pub struct AutomationEngine {
    rules: Vec<Rule>,
    next_id: u32,
    store: Rc<RefCell<PersistentStore>>,
    custom: HashMap<String, CustomHandler>,
}

impl AutomationEngine {
    pub fn new(store: Rc<RefCell<PersistentStore>>) -> AutomationEngine {
        AutomationEngine {
            rules: Vec::new(),
            next_id: 1,
            store,
            custom: HashMap::new(),
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn register_custom(&mut self, name: &str, handler: CustomHandler) {
        self.custom.insert(String::from(name), handler);
    }

    fn find(&self, id: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.id == id)
    }

    // Accepts a bare rule object or a {"rule": {...}} wrapper.
    pub fn create(&mut self, doc: &Json) -> Result<String> {
        let rule_doc = doc.get("rule").filter(|r| r.is_object()).unwrap_or(doc);

        let wire: RuleWire = serde_json::from_value(rule_doc.clone())
            .map_err(|e| AutomationError::ParseError(e.to_string()))?;

        if wire.triggers.is_empty() {
            return Err(AutomationError::EmptyTriggers);
        }
        if wire.actions.is_empty() {
            return Err(AutomationError::EmptyActions);
        }

        let id = match &wire.id {
            Some(id) if !id.is_empty() => {
                self.note_minted_id(id);
                id.clone()
            },
            _ => self.mint_id(),
        };

        if self.find(&id).is_some() {
            return Err(AutomationError::AlreadyExists);
        }

        let rule = Rule {
            id: id.clone(),
            name: wire.name.clone().unwrap_or_else(|| String::from("Unnamed Rule")),
            description: wire.description.clone().unwrap_or_default(),
            triggers: wire.triggers
                .iter()
                .cloned()
                .map(|spec| Trigger { spec, last_check: 0, last_fired: 0 })
                .collect(),
            actions: wire.actions.clone(),
            enabled: wire.enabled,
            persistent: wire.persistent,
            pending: false,
        };

        if rule.persistent {
            self.persist(&rule)?;
        }

        debug!("automation: rule '{}' created ({} trigger(s), {} action(s))",
               id, rule.triggers.len(), rule.actions.len());
        self.rules.push(rule);
        Ok(id)
    }

    fn mint_id(&mut self) -> String {
        let id = format!("rule_{}", self.next_id);
        self.next_id += 1;
        id
    }

    // Keep the counter ahead of any caller-supplied rule_<n> id so
    // minted ids never collide after a reload.
    fn note_minted_id(&mut self, id: &str) {
        if let Some(rest) = id.strip_prefix("rule_") {
            if let Ok(n) = rest.parse::<u32>() {
                if n >= self.next_id {
                    self.next_id = n + 1;
                }
            }
        }
    }

    fn persist(&self, rule: &Rule) -> Result<()> {
        let key = format!("{}{}", RULE_KEY_PREFIX, rule.id);
        let body = serde_json::to_string(&rule.to_wire())
            .map_err(|_| AutomationError::PersistFailed)?;
        self.store
            .borrow_mut()
            .write(&key, body.as_bytes())
            .map_err(|e| {
                warn!("automation: persisting '{}' failed: {:?}", rule.id, e);
                AutomationError::PersistFailed
            })
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<()> {
        let index = self.find(id).ok_or(AutomationError::NotFound)?;
        self.rules[index].enabled = enabled;
        if self.rules[index].persistent {
            let rule = &self.rules[index];
            self.persist(rule)?;
        }
        Ok(())
    }

    pub fn delete(&mut self, id: &str) -> Result<()> {
        let index = self.find(id).ok_or(AutomationError::NotFound)?;
        let rule = self.rules.remove(index);
        if rule.persistent {
            let key = format!("{}{}", RULE_KEY_PREFIX, rule.id);
            let _ = self.store.borrow_mut().delete(&key);
        }
        Ok(())
    }

    // Manual fire: run the actions now, regardless of triggers.
    pub fn trigger(
        &mut self,
        id: &str,
        registry: &mut ToolRegistry,
        actuators: &mut dyn ActuatorSink
    ) -> Result<usize> {
        let index = self.find(id).ok_or(AutomationError::NotFound)?;
        if !self.rules[index].enabled {
            return Err(AutomationError::Disabled);
        }
        let rule_id = self.rules[index].id.clone();
        let actions = self.rules[index].actions.clone();
        Ok(self.run_actions(&rule_id, &actions, registry, actuators))
    }

    // Bus hook: mark every enabled rule with a matching event
    // trigger; the actions run on the next tick.
    pub fn on_event(&mut self, event: &Event) {
        for rule in &mut self.rules {
            if !rule.enabled || rule.pending {
                continue;
            }
            let matched = rule.triggers.iter().any(|t| match &t.spec {
                TriggerSpec::Event { event_type, source } => {
                    event_type == event.kind.name()
                        && match (source, &event.source) {
                            (Some(want), Some(have)) => want == have,
                            (Some(_), None) => false,
                            (None, _) => true,
                        }
                },
                _ => false,
            });
            if matched {
                debug!("automation: rule '{}' pending on event {}",
                       rule.id, event.id);
                rule.pending = true;
            }
        }
    }

    // Tick evaluation. Any trigger firing suffices.
    pub fn process(
        &mut self,
        now: u64,
        registry: &mut ToolRegistry,
        sensors: &dyn SensorReader,
        actuators: &mut dyn ActuatorSink
    ) -> ProcessReport {
        let mut report = ProcessReport::default();

        for index in 0..self.rules.len() {
            if !self.rules[index].enabled {
                continue;
            }

            let mut triggered = self.rules[index].pending;
            self.rules[index].pending = false;

            if !triggered {
                for trigger in &mut self.rules[index].triggers {
                    match &trigger.spec {
                        TriggerSpec::Schedule { interval_ms } => {
                            if now.saturating_sub(trigger.last_fired)
                                >= *interval_ms {
                                trigger.last_fired = now;
                                triggered = true;
                            }
                        },
                        TriggerSpec::Condition {
                            sensor, operator, value, poll_interval_ms
                        } => {
                            if now.saturating_sub(trigger.last_check)
                                >= *poll_interval_ms {
                                trigger.last_check = now;
                                if let Some(actual) = sensors.read(sensor) {
                                    if compare(&actual, *operator, value) {
                                        triggered = true;
                                    }
                                }
                            }
                        },
                        TriggerSpec::Event { .. } | TriggerSpec::Manual => {},
                    }
                    if triggered {
                        break;
                    }
                }
            }

            if triggered {
                report.rules_fired += 1;
                let rule_id = self.rules[index].id.clone();
                let actions = self.rules[index].actions.clone();
                report.actions_failed +=
                    self.run_actions(&rule_id, &actions, registry, actuators);
            }
        }

        report
    }

    fn run_actions(
        &mut self,
        rule_id: &str,
        actions: &[ActionSpec],
        registry: &mut ToolRegistry,
        actuators: &mut dyn ActuatorSink
    ) -> usize {
        let mut failed = 0;

        for action in actions {
            let ok = match action {
                ActionSpec::Tool { tool, params } => {
                    let params = if params.is_null() {
                        json!({})
                    } else {
                        params.clone()
                    };
                    let invocation = json!({"tool": tool, "params": params});
                    registry.execute(&invocation).is_success()
                },

                ActionSpec::Actuator { target, command, params } => {
                    actuators.command(target, command, params).is_ok()
                },

                ActionSpec::Notification { message, level, destination } => {
                    match level.as_str() {
                        "error" => warn!("[{}] {}", destination, message),
                        "warn" => warn!("[{}] {}", destination, message),
                        _ => info!("[{}] {}", destination, message),
                    }
                    true
                },

                ActionSpec::Custom { handler, params } => {
                    match self.custom.get_mut(handler) {
                        Some(f) => f(params),
                        None => {
                            warn!("automation: no custom handler '{}'", handler);
                            false
                        }
                    }
                },
            };

            if !ok {
                failed += 1;
                warn!("automation: action failed in rule '{}'", rule_id);
            }
        }

        failed
    }

    pub fn export_all(&self) -> Json {
        let rules: Vec<Json> = self.rules
            .iter()
            .map(|r| serde_json::to_value(r.to_wire()).unwrap_or(Json::Null))
            .collect();
        Json::Array(rules)
    }

    // Import an exported array; individually bad entries are
    // skipped so one rotten rule cannot block the rest.
    pub fn import(&mut self, doc: &Json) -> Result<usize> {
        let entries = doc.as_array().ok_or_else(|| {
            AutomationError::ParseError(String::from("expected an array"))
        })?;

        let mut imported = 0;
        for entry in entries {
            match self.create(entry) {
                Ok(_) => imported += 1,
                Err(e) => warn!("automation: import skipped a rule: {:?}", e),
            }
        }
        Ok(imported)
    }

    // Replay persistent snapshots at boot.
    pub fn load_all(&mut self) -> usize {
        let keys = self.store.borrow().keys_with_prefix(RULE_KEY_PREFIX);

        let mut loaded = 0;
        for key in keys {
            let raw = match self.store.borrow().read(&key) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let doc: Json = match serde_json::from_slice(&raw) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("automation: skipping {}: {}", key, e);
                    continue;
                }
            };
            match self.create(&doc) {
                Ok(_) => loaded += 1,
                Err(AutomationError::AlreadyExists) => {},
                Err(e) => warn!("automation: could not restore {}: {:?}", key, e),
            }
        }
        loaded
    }
}


fn compare(actual: &Value, op: CompareOp, expected: &Json) -> bool {
    let expected = Value::from_json(expected);

    let as_bool = |r: crate::value::Result<Value>| match r {
        Ok(Value::Bool(b)) => b,
        _ => false,
    };

    match op {
        CompareOp::Eq => value_eq(actual, &expected),
        CompareOp::Neq => as_bool(actual.neq(&expected)),
        CompareOp::Gt => as_bool(actual.gt(&expected)),
        CompareOp::Lt => as_bool(actual.lt(&expected)),
        CompareOp::Gte => as_bool(actual.gte(&expected)),
        CompareOp::Lte => as_bool(actual.lte(&expected)),
        CompareOp::Contains | CompareOp::StartsWith | CompareOp::EndsWith => {
            match (actual, &expected) {
                (Value::Str(a), Value::Str(b)) => match op {
                    CompareOp::Contains => a.contains(b.as_str()),
                    CompareOp::StartsWith => a.starts_with(b.as_str()),
                    _ => a.ends_with(b.as_str()),
                },
                _ => false,
            }
        },
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::PlatformMemory;
    use crate::event::EventKind;
    use crate::govern::Governor;
    use crate::storage::{MediumBackend, MemMedium};
    use crate::tools::{builtin_echo, builtin_log};

    fn store_on(medium: &MemMedium) -> Rc<RefCell<PersistentStore>> {
        let backend = MediumBackend::open(Box::new(medium.clone())).unwrap();
        Rc::new(RefCell::new(PersistentStore::new(Box::new(backend))))
    }

    fn registry(store: &Rc<RefCell<PersistentStore>>) -> ToolRegistry {
        let platform = PlatformMemory {
            total_bytes: 256 * 1024,
            available_bytes: 128 * 1024,
        };
        let mut registry = ToolRegistry::new(
            16,
            store.clone(),
            Governor::new(platform),
            Rc::new(Clock::new())
        ).unwrap();
        registry.init().unwrap();
        registry.register_native("system.log", builtin_log, None).unwrap();
        registry.register_native("system.echo", builtin_echo, None).unwrap();
        registry
    }

    struct MapSensors(HashMap<String, Value>);

    impl SensorReader for MapSensors {
        fn read(&self, sensor: &str) -> Option<Value> {
            self.0.get(sensor).cloned()
        }
    }

    struct RecordingActuators {
        commands: Vec<(String, String)>,
        fail: bool,
    }

    impl RecordingActuators {
        fn new() -> RecordingActuators {
            RecordingActuators { commands: Vec::new(), fail: false }
        }
    }

    impl ActuatorSink for RecordingActuators {
        fn command(
            &mut self,
            target: &str,
            command: &str,
            _params: &Json
        ) -> core::result::Result<(), String> {
            self.commands.push((String::from(target), String::from(command)));
            if self.fail {
                Err(String::from("actuator offline"))
            } else {
                Ok(())
            }
        }
    }

    fn tool_rule(id: &str, interval: u64) -> Json {
        json!({
            "id": id,
            "name": "tick tool",
            "triggers": [{"type": "schedule", "intervalMs": interval}],
            "actions": [{"type": "tool", "tool": "system.log",
                         "params": {"message": "fired"}}],
        })
    }

    #[test]
    fn test_create_validation() {
        let store = store_on(&MemMedium::new(16 * 1024));
        let mut engine = AutomationEngine::new(store);

        assert_eq!(
            engine.create(&json!({"triggers": [], "actions": []})).err(),
            Some(AutomationError::EmptyTriggers)
        );
        assert_eq!(
            engine.create(&json!({
                "triggers": [{"type": "manual"}],
                "actions": [],
            })).err(),
            Some(AutomationError::EmptyActions)
        );
        assert!(engine.create(&json!({"actions": "nonsense"})).is_err());
    }

    #[test]
    fn test_minted_ids_are_monotonic() {
        let store = store_on(&MemMedium::new(16 * 1024));
        let mut engine = AutomationEngine::new(store);

        let a = engine.create(&tool_rule("", 10)).unwrap();
        let b = engine.create(&json!({
            "triggers": [{"type": "manual"}],
            "actions": [{"type": "notification", "message": "m"}],
        })).unwrap();
        assert_ne!(a, b);
        assert!(b.starts_with("rule_"));

        // A supplied rule_<n> id pushes the mint counter past n.
        engine.create(&json!({
            "id": "rule_50",
            "triggers": [{"type": "manual"}],
            "actions": [{"type": "notification", "message": "m"}],
        })).unwrap();
        let c = engine.create(&json!({
            "triggers": [{"type": "manual"}],
            "actions": [{"type": "notification", "message": "m"}],
        })).unwrap();
        assert_eq!(c, "rule_51");
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = store_on(&MemMedium::new(16 * 1024));
        let mut engine = AutomationEngine::new(store);
        engine.create(&tool_rule("r1", 10)).unwrap();
        assert_eq!(
            engine.create(&tool_rule("r1", 10)).err(),
            Some(AutomationError::AlreadyExists)
        );
    }

    #[test]
    fn test_schedule_trigger_fires_on_interval() {
        let store = store_on(&MemMedium::new(16 * 1024));
        let mut reg = registry(&store);
        let mut engine = AutomationEngine::new(store);
        let mut actuators = RecordingActuators::new();
        engine.create(&tool_rule("r1", 100)).unwrap();

        // First tick past the interval fires.
        let report = engine.process(100, &mut reg, &NullSensors, &mut actuators);
        assert_eq!(report.rules_fired, 1);
        assert_eq!(report.actions_failed, 0);

        // Not due again yet.
        let report = engine.process(150, &mut reg, &NullSensors, &mut actuators);
        assert_eq!(report.rules_fired, 0);

        // Due again.
        let report = engine.process(200, &mut reg, &NullSensors, &mut actuators);
        assert_eq!(report.rules_fired, 1);
    }

    #[test]
    fn test_condition_trigger() {
        let store = store_on(&MemMedium::new(16 * 1024));
        let mut reg = registry(&store);
        let mut engine = AutomationEngine::new(store);
        let mut actuators = RecordingActuators::new();

        engine.create(&json!({
            "id": "hot",
            "triggers": [{"type": "condition", "sensor": "temp",
                          "operator": ">", "value": 30,
                          "pollIntervalMs": 10}],
            "actions": [{"type": "actuator", "target": "fan",
                         "command": "on"}],
        })).unwrap();

        let mut sensors = MapSensors(HashMap::new());
        sensors.0.insert(String::from("temp"), Value::Float(25.0));
        let report = engine.process(10, &mut reg, &sensors, &mut actuators);
        assert_eq!(report.rules_fired, 0);

        sensors.0.insert(String::from("temp"), Value::Float(35.0));
        let report = engine.process(20, &mut reg, &sensors, &mut actuators);
        assert_eq!(report.rules_fired, 1);
        assert_eq!(actuators.commands, vec![
            (String::from("fan"), String::from("on")),
        ]);
    }

    #[test]
    fn test_condition_poll_interval_gates_checks() {
        let store = store_on(&MemMedium::new(16 * 1024));
        let mut reg = registry(&store);
        let mut engine = AutomationEngine::new(store);
        let mut actuators = RecordingActuators::new();

        engine.create(&json!({
            "triggers": [{"type": "condition", "sensor": "temp",
                          "operator": ">", "value": 0,
                          "pollIntervalMs": 100}],
            "actions": [{"type": "notification", "message": "warm"}],
        })).unwrap();

        let mut sensors = MapSensors(HashMap::new());
        sensors.0.insert(String::from("temp"), Value::Float(5.0));

        assert_eq!(
            engine.process(100, &mut reg, &sensors, &mut actuators).rules_fired,
            1
        );
        // Within the poll interval the sensor is not consulted.
        assert_eq!(
            engine.process(150, &mut reg, &sensors, &mut actuators).rules_fired,
            0
        );
        assert_eq!(
            engine.process(200, &mut reg, &sensors, &mut actuators).rules_fired,
            1
        );
    }

    #[test]
    fn test_string_condition_operators() {
        assert!(compare(
            &Value::Str(String::from("living-room")),
            CompareOp::Contains,
            &json!("room")
        ));
        assert!(compare(
            &Value::Str(String::from("living-room")),
            CompareOp::StartsWith,
            &json!("living")
        ));
        assert!(compare(
            &Value::Str(String::from("living-room")),
            CompareOp::EndsWith,
            &json!("room")
        ));
        assert!(!compare(&Value::Int(5), CompareOp::Contains, &json!("5")));
        assert!(compare(&Value::Int(5), CompareOp::Eq, &json!(5)));
        assert!(compare(&Value::Float(5.5), CompareOp::Gte, &json!(5)));
    }

    #[test]
    fn test_event_trigger_via_hook() {
        let store = store_on(&MemMedium::new(16 * 1024));
        let mut reg = registry(&store);
        let mut engine = AutomationEngine::new(store);
        let mut actuators = RecordingActuators::new();

        engine.create(&json!({
            "triggers": [{"type": "event", "eventType": "sensor",
                          "source": "temp1"}],
            "actions": [{"type": "actuator", "target": "led",
                         "command": "blink"}],
        })).unwrap();

        // A tick without the event does nothing.
        let report = engine.process(10, &mut reg, &NullSensors, &mut actuators);
        assert_eq!(report.rules_fired, 0);

        // Non-matching source does not mark the rule.
        engine.on_event(&Event {
            kind: EventKind::Sensor,
            id: 1,
            source: Some(String::from("temp2")),
            timestamp_ms: 0,
            data: Vec::new(),
        });
        let report = engine.process(20, &mut reg, &NullSensors, &mut actuators);
        assert_eq!(report.rules_fired, 0);

        // Matching event marks the rule; the next tick runs it.
        engine.on_event(&Event {
            kind: EventKind::Sensor,
            id: 2,
            source: Some(String::from("temp1")),
            timestamp_ms: 0,
            data: Vec::new(),
        });
        let report = engine.process(30, &mut reg, &NullSensors, &mut actuators);
        assert_eq!(report.rules_fired, 1);
        assert_eq!(actuators.commands.len(), 1);
    }

    #[test]
    fn test_manual_trigger() {
        let store = store_on(&MemMedium::new(16 * 1024));
        let mut reg = registry(&store);
        let mut engine = AutomationEngine::new(store);
        let mut actuators = RecordingActuators::new();

        engine.create(&json!({
            "id": "m1",
            "triggers": [{"type": "manual"}],
            "actions": [{"type": "actuator", "target": "pump",
                         "command": "run"}],
        })).unwrap();

        // Manual rules never fire on the tick.
        let report = engine.process(1000, &mut reg, &NullSensors, &mut actuators);
        assert_eq!(report.rules_fired, 0);

        assert_eq!(engine.trigger("m1", &mut reg, &mut actuators), Ok(0));
        assert_eq!(actuators.commands.len(), 1);

        engine.set_enabled("m1", false).unwrap();
        assert_eq!(
            engine.trigger("m1", &mut reg, &mut actuators),
            Err(AutomationError::Disabled)
        );
        assert_eq!(
            engine.trigger("nope", &mut reg, &mut actuators),
            Err(AutomationError::NotFound)
        );
    }

    #[test]
    fn test_failing_action_does_not_stop_later_ones() {
        let store = store_on(&MemMedium::new(16 * 1024));
        let mut reg = registry(&store);
        let mut engine = AutomationEngine::new(store);
        let mut actuators = RecordingActuators::new();
        actuators.fail = true;

        engine.create(&json!({
            "id": "r1",
            "triggers": [{"type": "manual"}],
            "actions": [
                {"type": "actuator", "target": "a", "command": "x"},
                {"type": "tool", "tool": "no.such.tool"},
                {"type": "actuator", "target": "b", "command": "y"},
            ],
        })).unwrap();

        let failed = engine.trigger("r1", &mut reg, &mut actuators).unwrap();
        assert_eq!(failed, 3);
        // Both actuator actions ran despite the failures between.
        assert_eq!(actuators.commands.len(), 2);
        // The rule is still enabled.
        assert_eq!(engine.trigger("r1", &mut reg, &mut actuators), Ok(3));
    }

    #[test]
    fn test_custom_handler() {
        let store = store_on(&MemMedium::new(16 * 1024));
        let mut reg = registry(&store);
        let mut engine = AutomationEngine::new(store);
        let mut actuators = RecordingActuators::new();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        engine.register_custom("collect", Box::new(move |params: &Json| {
            seen2.borrow_mut().push(params.clone());
            true
        }));

        engine.create(&json!({
            "id": "c1",
            "triggers": [{"type": "manual"}],
            "actions": [
                {"type": "custom", "handler": "collect",
                 "params": {"n": 1}},
                {"type": "custom", "handler": "missing"},
            ],
        })).unwrap();

        let failed = engine.trigger("c1", &mut reg, &mut actuators).unwrap();
        assert_eq!(failed, 1);
        assert_eq!(*seen.borrow(), vec![json!({"n": 1})]);
    }

    #[test]
    fn test_persistent_rule_survives_reload() {
        let medium = MemMedium::new(16 * 1024);
        {
            let store = store_on(&medium);
            let mut engine = AutomationEngine::new(store);
            engine.create(&json!({
                "id": "keep",
                "name": "kept rule",
                "persistent": true,
                "triggers": [{"type": "schedule", "intervalMs": 500}],
                "actions": [{"type": "notification", "message": "hello"}],
            })).unwrap();
        }

        let store = store_on(&medium);
        let mut engine = AutomationEngine::new(store);
        assert_eq!(engine.load_all(), 1);
        assert_eq!(engine.rule_count(), 1);

        let exported = engine.export_all();
        assert_eq!(exported[0]["id"], json!("keep"));
        assert_eq!(exported[0]["name"], json!("kept rule"));
        assert_eq!(exported[0]["persistent"], json!(true));
    }

    #[test]
    fn test_delete_removes_snapshot() {
        let medium = MemMedium::new(16 * 1024);
        let store = store_on(&medium);
        let mut engine = AutomationEngine::new(store.clone());
        engine.create(&json!({
            "id": "gone",
            "persistent": true,
            "triggers": [{"type": "manual"}],
            "actions": [{"type": "notification", "message": "x"}],
        })).unwrap();
        assert!(store.borrow().exists("rule.gone"));

        engine.delete("gone").unwrap();
        assert!(!store.borrow().exists("rule.gone"));
        assert_eq!(engine.delete("gone"), Err(AutomationError::NotFound));
    }

    #[test]
    fn test_export_import_round_trip() {
        let store = store_on(&MemMedium::new(16 * 1024));
        let mut engine = AutomationEngine::new(store);
        engine.create(&tool_rule("r1", 10)).unwrap();
        engine.create(&json!({
            "id": "r2",
            "triggers": [{"type": "event", "eventType": "sensor"}],
            "actions": [{"type": "notification", "message": "m",
                         "level": "warn", "destination": "log"}],
        })).unwrap();

        let exported = engine.export_all();

        let store2 = store_on(&MemMedium::new(16 * 1024));
        let mut other = AutomationEngine::new(store2);
        assert_eq!(other.import(&exported), Ok(2));
        assert_eq!(other.rule_count(), 2);
        assert_eq!(other.export_all(), exported);
    }

    #[test]
    fn test_disabled_rule_skipped() {
        let store = store_on(&MemMedium::new(16 * 1024));
        let mut reg = registry(&store);
        let mut engine = AutomationEngine::new(store);
        let mut actuators = RecordingActuators::new();

        engine.create(&tool_rule("r1", 10)).unwrap();
        engine.set_enabled("r1", false).unwrap();
        let report = engine.process(1000, &mut reg, &NullSensors, &mut actuators);
        assert_eq!(report.rules_fired, 0);
    }
}
