// Sessions and operations.
//
// A session is an external client's conversation with the runtime:
// an opaque minted id, a transport tag, activity timestamps, and
// counters. Operations are work units inside exactly one session,
// each carrying a type tag and the context field that type needs
// (resource path, event type, or tool name). Sessions end on
// explicit close or when the idle sweep finds them timed out;
// closing a session cancels whatever operations it still has open.

use log::{debug, info};
use serde_json::{json, Value as Json};


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
}


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperationType {
    Tool,
    Resource,
    Event,
    Custom,
}

impl OperationType {
    fn name(self) -> &'static str {
        match self {
            OperationType::Tool => "tool",
            OperationType::Resource => "resource",
            OperationType::Event => "event",
            OperationType::Custom => "custom",
        }
    }
}


#[derive(Clone, Debug, PartialEq)]
pub enum SessionError {
    CapacityExhausted,
    NotFound,
    OperationNotFound,
    AlreadyCompleted,
}

pub type Result<T> = core::result::Result<T, SessionError>;


pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub transport: String,
    pub client_info: Option<String>,
    pub created_ms: u64,
    pub last_activity_ms: u64,
    pub operation_count: u32,
    pub active_operations: u32,
}


pub struct Operation {
    pub id: String,
    pub session_id: String,
    pub kind: OperationType,
    pub created_ms: u64,
    pub completed_ms: u64,
    pub completed: bool,
    pub success: bool,
    pub resource_path: Option<String>,
    pub event_type: Option<String>,
    pub tool_name: Option<String>,
}


pub struct SessionTable {
    sessions: Vec<Session>,
    operations: Vec<Operation>,
    max_sessions: usize,
    next_session: u32,
    next_operation: u32,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> SessionTable {
        SessionTable {
            sessions: Vec::with_capacity(max_sessions),
            operations: Vec::new(),
            max_sessions,
            next_session: 1,
            next_operation: 1,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn create(
        &mut self,
        transport: &str,
        client_info: Option<&str>,
        now: u64
    ) -> Result<String> {
        if self.sessions.len() >= self.max_sessions {
            return Err(SessionError::CapacityExhausted);
        }

        let id = format!("sess_{}", self.next_session);
        self.next_session += 1;

        self.sessions.push(Session {
            id: id.clone(),
            state: SessionState::Active,
            transport: String::from(transport),
            client_info: client_info.map(String::from),
            created_ms: now,
            last_activity_ms: now,
            operation_count: 0,
            active_operations: 0,
        });

        info!("session {} opened on {}", id, transport);
        Ok(id)
    }

    pub fn find(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn update_activity(&mut self, id: &str, now: u64) -> Result<()> {
        let session = self.sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(SessionError::NotFound)?;
        session.last_activity_ms = now;
        Ok(())
    }

    // Close cancels open operations and removes the session.
    pub fn close(&mut self, id: &str, reason: &str, now: u64) -> Result<()> {
        let index = self.sessions
            .iter()
            .position(|s| s.id == id)
            .ok_or(SessionError::NotFound)?;

        for op in self.operations.iter_mut() {
            if op.session_id == id && !op.completed {
                op.completed = true;
                op.success = false;
                op.completed_ms = now;
            }
        }
        self.operations.retain(|op| op.session_id != id);

        self.sessions.remove(index);
        info!("session {} closed: {}", id, reason);
        Ok(())
    }

    pub fn create_operation(
        &mut self,
        session_id: &str,
        kind: OperationType,
        now: u64
    ) -> Result<String> {
        let session = self.sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or(SessionError::NotFound)?;

        let id = format!("op_{}", self.next_operation);
        self.next_operation += 1;

        session.operation_count += 1;
        session.active_operations += 1;
        session.last_activity_ms = now;

        self.operations.push(Operation {
            id: id.clone(),
            session_id: String::from(session_id),
            kind,
            created_ms: now,
            completed_ms: 0,
            completed: false,
            success: false,
            resource_path: None,
            event_type: None,
            tool_name: None,
        });

        debug!("operation {} ({}) opened in {}", id, kind.name(), session_id);
        Ok(id)
    }

    pub fn find_operation(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }

    fn finish_operation(
        &mut self,
        id: &str,
        success: bool,
        now: u64
    ) -> Result<()> {
        let op = self.operations
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or(SessionError::OperationNotFound)?;
        if op.completed {
            return Err(SessionError::AlreadyCompleted);
        }

        op.completed = true;
        op.success = success;
        op.completed_ms = now;
        let session_id = op.session_id.clone();

        if let Some(session) = self.sessions
            .iter_mut()
            .find(|s| s.id == session_id) {
            session.active_operations =
                session.active_operations.saturating_sub(1);
            session.last_activity_ms = now;
        }
        Ok(())
    }

    pub fn complete_operation(
        &mut self,
        id: &str,
        success: bool,
        now: u64
    ) -> Result<()> {
        self.finish_operation(id, success, now)
    }

    pub fn cancel_operation(
        &mut self,
        id: &str,
        reason: &str,
        now: u64
    ) -> Result<()> {
        debug!("operation {} cancelled: {}", id, reason);
        self.finish_operation(id, false, now)
    }

    fn operation_mut(&mut self, id: &str) -> Result<&mut Operation> {
        self.operations
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or(SessionError::OperationNotFound)
    }

    pub fn set_operation_resource(&mut self, id: &str, path: &str) -> Result<()> {
        self.operation_mut(id)?.resource_path = Some(String::from(path));
        Ok(())
    }

    pub fn set_operation_event(&mut self, id: &str, event_type: &str) -> Result<()> {
        self.operation_mut(id)?.event_type = Some(String::from(event_type));
        Ok(())
    }

    pub fn set_operation_tool(&mut self, id: &str, tool: &str) -> Result<()> {
        self.operation_mut(id)?.tool_name = Some(String::from(tool));
        Ok(())
    }

    // Close every session idle past the limit. Returns how many
    // were closed.
    pub fn process_timeouts(&mut self, now: u64, idle_limit_ms: u64) -> usize {
        let stale: Vec<String> = self.sessions
            .iter()
            .filter(|s| now.saturating_sub(s.last_activity_ms) > idle_limit_ms)
            .map(|s| s.id.clone())
            .collect();

        for id in &stale {
            let _ = self.close(id, "idle timeout", now);
        }
        stale.len()
    }

    pub fn sessions_json(&self) -> Json {
        let sessions: Vec<Json> = self.sessions
            .iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "transport": s.transport,
                    "clientInfo": s.client_info,
                    "createdMs": s.created_ms,
                    "lastActivityMs": s.last_activity_ms,
                    "operationCount": s.operation_count,
                    "activeOperations": s.active_operations,
                })
            })
            .collect();
        Json::Array(sessions)
    }

    pub fn operations_json(&self, session_id: &str) -> Json {
        let operations: Vec<Json> = self.operations
            .iter()
            .filter(|op| op.session_id == session_id)
            .map(|op| {
                json!({
                    "id": op.id,
                    "type": op.kind.name(),
                    "completed": op.completed,
                    "success": op.success,
                    "resourcePath": op.resource_path,
                    "eventType": op.event_type,
                    "toolName": op.tool_name,
                })
            })
            .collect();
        Json::Array(operations)
    }
}
