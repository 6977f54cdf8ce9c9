// Top-level runtime wiring.
//
// System owns every component and drives the single main tick:
// scheduler first, then the event drain, then automation, then the
// session idle sweep. Nothing in the core runs outside this loop;
// background producers may publish events but never touch core
// tables directly.
//
// Init order follows the dependency graph leaves-first: logger,
// persistent store, config store, memory regions, governor, tool
// registry (which replays persisted tools), automation (which
// replays persisted rules), event bus with the automation hook,
// scheduler, session table.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use log::{info, warn};
use serde_json::Value as Json;

use crate::automation::{
    ActuatorSink, AutomationEngine, AutomationError, LogActuators,
    NullSensors, SensorReader,
};
use crate::clock::Clock;
use crate::config::{ConfigError, ConfigStore, StorageChoice, SystemConfig};
use crate::event::{EventBus, EventError, EventKind};
use crate::govern::{Governor, RuntimeConfig};
use crate::logging;
use crate::memory::{MemoryManager, RegionKind, RegionStats};
use crate::scheduler::{Priority, Scheduler, TaskFn, TaskId};
use crate::session::{OperationType, SessionTable};
use crate::storage::{
    DirBackend, FileMedium, KvBackend, MediumBackend, MemMedium,
    PersistentStore, StoreError,
};
use crate::tools::{
    builtin_echo, builtin_log, list_tools_stub, RegistryError, ToolRegistry,
    ToolResult, LIST_TOOLS,
};


#[derive(Debug)]
pub enum SystemError {
    Config(ConfigError),
    Storage(StoreError),
    Registry(RegistryError),
    Events(EventError),
}

pub type Result<T> = core::result::Result<T, SystemError>;


#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    pub tasks_run: usize,
    pub events_processed: usize,
    pub rules_fired: usize,
    pub actions_failed: usize,
    pub sessions_closed: usize,
}


pub struct System {
    config: SystemConfig,
    clock: Rc<Clock>,
    store: Rc<RefCell<PersistentStore>>,
    pub config_store: ConfigStore,
    memory: MemoryManager,
    events: Rc<EventBus>,
    scheduler: Scheduler,
    registry: ToolRegistry,
    automation: Rc<RefCell<AutomationEngine>>,
    sessions: SessionTable,
    sensors: Box<dyn SensorReader>,
    actuators: Box<dyn ActuatorSink>,
}

impl System {
    pub fn init(config: SystemConfig) -> Result<System> {
        let backend: Box<dyn KvBackend> = match &config.storage {
            StorageChoice::Memory(size) => {
                let medium = MemMedium::new(*size);
                Box::new(
                    MediumBackend::open(Box::new(medium))
                        .map_err(SystemError::Storage)?
                )
            },
            StorageChoice::File(path, size) => {
                let medium = FileMedium::open(PathBuf::from(path), *size)
                    .map_err(SystemError::Storage)?;
                Box::new(
                    MediumBackend::open(Box::new(medium))
                        .map_err(SystemError::Storage)?
                )
            },
            StorageChoice::Directory(path) => {
                Box::new(
                    DirBackend::open(PathBuf::from(path))
                        .map_err(SystemError::Storage)?
                )
            },
        };
        Self::init_with_backend(config, backend)
    }

    // Platform code with its own storage primitive (native NVS,
    // battery-backed RAM) plugs it in here.
    pub fn init_with_backend(
        config: SystemConfig,
        backend: Box<dyn KvBackend>
    ) -> Result<System> {
        let config = config.validate().map_err(SystemError::Config)?;

        logging::init(config.log_level.to_filter());
        info!("system: {} starting", config.device_name);

        let clock = Rc::new(Clock::new());
        let store = Rc::new(RefCell::new(PersistentStore::new(backend)));

        let mut config_store = ConfigStore::new(config.max_config_entries);
        let restored = config_store.load_persistent(&store.borrow());
        if restored > 0 {
            info!("system: {} config entr(ies) restored", restored);
        }

        let total = config.platform.total_bytes as usize;
        let memory = MemoryManager::new(&[
            (RegionKind::Static, total / 32),
            (RegionKind::Dynamic, total / 8),
            (RegionKind::Tool, total / 16),
            (RegionKind::Resource, total / 32),
            (RegionKind::System, total / 32),
        ]);

        let mut governor = Governor::new(config.platform);
        if let Some(bytecode_config) = config.bytecode {
            governor.set_config(bytecode_config);
        }

        let mut registry = ToolRegistry::new(
            config.max_tools,
            store.clone(),
            governor,
            clock.clone()
        ).map_err(SystemError::Registry)?;
        registry.init().map_err(SystemError::Registry)?;
        registry
            .register_native("system.log", builtin_log, None)
            .map_err(SystemError::Registry)?;
        registry
            .register_native("system.echo", builtin_echo, None)
            .map_err(SystemError::Registry)?;
        registry
            .register_native(LIST_TOOLS, list_tools_stub, None)
            .map_err(SystemError::Registry)?;

        let automation =
            Rc::new(RefCell::new(AutomationEngine::new(store.clone())));
        let rules = automation.borrow_mut().load_all();
        if rules > 0 {
            info!("system: {} rule(s) restored", rules);
        }

        let events = Rc::new(EventBus::new(
            config.max_event_handlers,
            config.event_queue_size
        ));
        let hook = automation.clone();
        events
            .subscribe(None, None, Box::new(move |event| {
                hook.borrow_mut().on_event(event);
            }))
            .map_err(SystemError::Events)?;

        let scheduler = Scheduler::new(config.max_tasks);
        let sessions = SessionTable::new(config.max_sessions);

        Ok(System {
            config,
            clock,
            store,
            config_store,
            memory,
            events,
            scheduler,
            registry,
            automation,
            sessions,
            sensors: Box::new(NullSensors),
            actuators: Box::new(LogActuators),
        })
    }

    // One main tick.
    pub fn process(&mut self) -> TickReport {
        let now = self.clock.now_ms();
        self.process_at(now)
    }

    pub fn process_at(&mut self, now: u64) -> TickReport {
        let tasks_run = self.scheduler.process(now);
        let events_processed = self.events.process(0);

        let automation = self.automation.clone();
        let report = automation.borrow_mut().process(
            now,
            &mut self.registry,
            self.sensors.as_ref(),
            self.actuators.as_mut()
        );

        let sessions_closed = self.sessions
            .process_timeouts(now, self.config.session_timeout_ms);

        TickReport {
            tasks_run,
            events_processed,
            rules_fired: report.rules_fired,
            actions_failed: report.actions_failed,
            sessions_closed,
        }
    }

    // Flush durable state and quiesce the logger.
    pub fn deinit(mut self) {
        if let Err(e) = self.config_store
            .save_persistent(&mut self.store.borrow_mut()) {
            warn!("system: config snapshot failed: {:?}", e);
        }
        if let Err(e) = self.store.borrow_mut().commit() {
            warn!("system: final commit failed: {:?}", e);
        }
        info!("system: {} stopped", self.config.device_name);
        logging::shutdown();
    }

    // ------------------------------------------------------------------
    // Tools

    pub fn execute_tool(&mut self, doc: &Json) -> ToolResult {
        self.registry.execute(doc)
    }

    pub fn define_tool(&mut self, params: &Json)
        -> core::result::Result<String, RegistryError>
    {
        self.registry.register_dynamic(params)
    }

    pub fn tool_list(&self) -> Json {
        self.registry.list()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ToolRegistry {
        &mut self.registry
    }

    // ------------------------------------------------------------------
    // Automation

    pub fn create_rule(&mut self, doc: &Json)
        -> core::result::Result<String, AutomationError>
    {
        self.automation.borrow_mut().create(doc)
    }

    pub fn trigger_rule(&mut self, id: &str)
        -> core::result::Result<usize, AutomationError>
    {
        let automation = self.automation.clone();
        let result = automation.borrow_mut().trigger(
            id,
            &mut self.registry,
            self.actuators.as_mut()
        );
        result
    }

    pub fn automation(&self) -> Rc<RefCell<AutomationEngine>> {
        self.automation.clone()
    }

    // ------------------------------------------------------------------
    // Events, tasks, sessions

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn publish(
        &self,
        kind: EventKind,
        source: Option<&str>,
        data: &[u8]
    ) -> core::result::Result<u32, EventError> {
        self.events.publish(kind, source, self.clock.now_ms(), data)
    }

    pub fn schedule(
        &mut self,
        function: TaskFn,
        interval_ms: u64,
        priority: Priority
    ) -> core::result::Result<TaskId, crate::scheduler::SchedError> {
        self.scheduler.create(function, interval_ms, priority)
    }

    pub fn session_open(&mut self, transport: &str, client_info: Option<&str>)
        -> core::result::Result<String, crate::session::SessionError>
    {
        let now = self.clock.now_ms();
        self.sessions.create(transport, client_info, now)
    }

    pub fn session_close(&mut self, id: &str, reason: &str)
        -> core::result::Result<(), crate::session::SessionError>
    {
        let now = self.clock.now_ms();
        self.sessions.close(id, reason, now)
    }

    pub fn operation_open(&mut self, session: &str, kind: OperationType)
        -> core::result::Result<String, crate::session::SessionError>
    {
        let now = self.clock.now_ms();
        self.sessions.create_operation(session, kind, now)
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionTable {
        &mut self.sessions
    }

    // ------------------------------------------------------------------
    // Collaborators and resources

    pub fn set_sensor_reader(&mut self, sensors: Box<dyn SensorReader>) {
        self.sensors = sensors;
    }

    pub fn set_actuator_sink(&mut self, actuators: Box<dyn ActuatorSink>) {
        self.actuators = actuators;
    }

    pub fn set_bytecode_config(&mut self, config: RuntimeConfig)
        -> Vec<&'static str>
    {
        self.registry.governor_mut().set_config(config)
    }

    pub fn memory_stats(&self, kind: RegionKind) -> Option<RegionStats> {
        self.memory.stats(kind)
    }

    pub fn memory_mut(&mut self) -> &mut MemoryManager {
        &mut self.memory
    }

    pub fn store(&self) -> Rc<RefCell<PersistentStore>> {
        self.store.clone()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quiet_config() -> SystemConfig {
        let mut config = SystemConfig::default();
        config.log_level = crate::config::LogLevel::Off;
        config
    }

    fn mem_backend(medium: &MemMedium) -> Box<dyn KvBackend> {
        Box::new(MediumBackend::open(Box::new(medium.clone())).unwrap())
    }

    #[test]
    fn test_init_and_builtins() {
        let system = System::init(quiet_config()).unwrap();
        let listing = system.tool_list();
        let names: Vec<&str> = listing
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"system.defineTool"));
        assert!(names.contains(&"system.log"));
        assert!(names.contains(&"system.echo"));
        system.deinit();
    }

    #[test]
    fn test_define_invoke_persist_restart() {
        let medium = MemMedium::new(64 * 1024);

        {
            let mut system = System::init_with_backend(
                quiet_config(),
                mem_backend(&medium)
            ).unwrap();

            let defined = system.execute_tool(&json!({
                "tool": "system.defineTool",
                "params": {
                    "name": "t.echo",
                    "implementationType": "composite",
                    "implementation": {
                        "steps": [
                            {"tool": "system.log",
                             "params": "{\"message\":\"hi\"}"},
                        ],
                    },
                    "persistent": true,
                },
            }));
            assert!(defined.is_success(), "{:?}", defined);

            let invoked = system.execute_tool(&json!({
                "tool": "t.echo", "params": {},
            }));
            assert!(invoked.is_success());
            system.deinit();
        }

        // Power cycle: a fresh system over the same medium has the
        // tool back.
        let mut system = System::init_with_backend(
            quiet_config(),
            mem_backend(&medium)
        ).unwrap();
        let invoked = system.execute_tool(&json!({
            "tool": "t.echo", "params": {},
        }));
        assert!(invoked.is_success(), "{:?}", invoked);
        system.deinit();
    }

    #[test]
    fn test_tick_drives_scheduler_and_rules() {
        let mut system = System::init(quiet_config()).unwrap();

        let ran = Rc::new(RefCell::new(0));
        let ran2 = ran.clone();
        system.schedule(
            Box::new(move || { *ran2.borrow_mut() += 1; }),
            10,
            Priority::Normal
        ).unwrap();

        system.create_rule(&json!({
            "id": "tick",
            "triggers": [{"type": "schedule", "intervalMs": 50}],
            "actions": [{"type": "tool", "tool": "system.log",
                         "params": {"message": "rule ran"}}],
        })).unwrap();

        let report = system.process_at(100);
        assert_eq!(report.tasks_run, 1);
        assert_eq!(report.rules_fired, 1);
        assert_eq!(report.actions_failed, 0);
        system.deinit();
    }

    #[test]
    fn test_event_rule_fires_through_bus() {
        let mut system = System::init(quiet_config()).unwrap();

        system.create_rule(&json!({
            "triggers": [{"type": "event", "eventType": "sensor",
                          "source": "temp1"}],
            "actions": [{"type": "tool", "tool": "system.log",
                         "params": {"message": "sensor moved"}}],
        })).unwrap();

        system.publish(EventKind::Sensor, Some("temp1"), b"25.0").unwrap();

        let report = system.process_at(10);
        assert_eq!(report.events_processed, 1);
        assert_eq!(report.rules_fired, 1);

        // No event, no fire.
        let report = system.process_at(20);
        assert_eq!(report.rules_fired, 0);
        system.deinit();
    }

    #[test]
    fn test_session_idle_sweep() {
        let mut config = quiet_config();
        config.session_timeout_ms = 1000;
        let mut system = System::init(config).unwrap();

        let sid = system.session_open("uart0", None).unwrap();
        assert!(system.sessions().find(&sid).is_some());

        let report = system.process_at(5000);
        assert_eq!(report.sessions_closed, 1);
        assert!(system.sessions().find(&sid).is_none());
        system.deinit();
    }

    #[test]
    fn test_memory_regions_present() {
        let system = System::init(quiet_config()).unwrap();
        let stats = system.memory_stats(RegionKind::Dynamic).unwrap();
        assert!(stats.total > 0);
        assert_eq!(stats.used, 0);
        system.deinit();
    }

    #[test]
    fn test_bytecode_config_capping() {
        let mut system = System::init(quiet_config()).unwrap();
        let mut config = system.registry().governor().config();
        config.max_stack_size = 60_000;
        let capped = system.set_bytecode_config(config);
        assert!(capped.contains(&"max_stack_size"));
        system.deinit();
    }
}
