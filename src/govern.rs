// Bytecode memory governor.
//
// Untrusted bytecode stays bounded because every program and
// context allocation is admitted here first. The governor holds
// the runtime configuration (per-field capacity ceilings, the
// execution-time ceiling, and a global memory limit), a running
// total of everything charged under it, and a recommended
// configuration derived from the platform's memory figures.
//
// Admission is all-or-nothing: a program either gets its full
// capacity charged or the total is untouched. Release always
// deaccounts exactly what was charged, so alloc/free pairs leave
// the total unchanged.

use log::{debug, warn};
use serde::Deserialize;

use crate::bytecode::{Opcode, Program};
use crate::config::PlatformMemory;
use crate::vm::ExecContext;


// Hard caps applied when a caller writes the configuration,
// whatever the platform figures say.
const STACK_HARD_CAP: u16 = 10_000;
const STRING_POOL_HARD_CAP: u16 = 0xFFFF;
const STRING_POOL_SAFE_CAP: u32 = 100_000;

// Allocations above this size must also fit in half the platform's
// available memory.
const LARGE_ALLOCATION: usize = 1024;


#[derive(Deserialize, Copy, Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    pub max_bytecode_size: u32,
    pub max_stack_size: u16,
    pub max_string_pool_size: u16,
    pub max_variable_count: u16,
    pub max_function_count: u16,
    pub max_execution_time_ms: u32,
    pub dynamic_allocation: bool,
    pub total_memory_limit: u32,
}


#[derive(Clone, Debug, PartialEq)]
pub enum GovernError {
    NotAllowed(&'static str),
    QuotaExceeded,
    DynamicAllocationDisabled,
}

pub type Result<T> = core::result::Result<T, GovernError>;


// A program admitted under the governor, carrying the amount that
// was charged for it so release is exact.
pub struct LoadedProgram {
    pub program: Program,
    pub(crate) charged: usize,
}

impl LoadedProgram {
    pub fn charged(&self) -> usize {
        self.charged
    }
}


pub struct Governor {
    config: RuntimeConfig,
    total_allocated: usize,
    platform: PlatformMemory,
}

impl Governor {
    pub fn new(platform: PlatformMemory) -> Governor {
        Governor {
            config: recommended(platform),
            total_allocated: 0,
            platform,
        }
    }

    pub fn config(&self) -> RuntimeConfig {
        self.config
    }

    pub fn recommended(&self) -> RuntimeConfig {
        recommended(self.platform)
    }

    pub fn total_allocated(&self) -> usize {
        self.total_allocated
    }

    // Install a new configuration, capping unsafe fields against
    // the platform-derived recommendation. Returns the names of
    // every field that was capped.
    pub fn set_config(&mut self, requested: RuntimeConfig)
        -> Vec<&'static str>
    {
        let safe = self.recommended();
        let mut adjusted = requested;
        let mut capped = Vec::new();

        if adjusted.max_bytecode_size > safe.total_memory_limit {
            adjusted.max_bytecode_size = safe.total_memory_limit;
            capped.push("max_bytecode_size");
        }
        if adjusted.max_stack_size > STACK_HARD_CAP {
            adjusted.max_stack_size = STACK_HARD_CAP;
            capped.push("max_stack_size");
        }
        if u32::from(adjusted.max_string_pool_size) > STRING_POOL_SAFE_CAP {
            adjusted.max_string_pool_size = STRING_POOL_HARD_CAP;
            capped.push("max_string_pool_size");
        }
        if adjusted.total_memory_limit > safe.total_memory_limit {
            adjusted.total_memory_limit = safe.total_memory_limit;
            capped.push("total_memory_limit");
        }

        for field in &capped {
            warn!("governor: {} capped to a safe value", field);
        }

        self.config = adjusted;
        capped
    }

    pub fn reset_config(&mut self) {
        self.config = self.recommended();
    }

    pub fn can_allocate(&self, size: usize) -> bool {
        if self.total_allocated + size
            > self.config.total_memory_limit as usize {
            return false;
        }
        // Large requests must leave the rest of the platform room
        // to breathe.
        if size > LARGE_ALLOCATION
            && size > self.platform.available_bytes as usize / 2 {
            return false;
        }
        true
    }

    pub fn track_alloc(&mut self, size: usize) {
        self.total_allocated += size;
        debug!("governor: +{} bytes, total {}", size, self.total_allocated);
    }

    pub fn track_free(&mut self, size: usize) {
        if size > self.total_allocated {
            warn!("governor: releasing {} with only {} accounted",
                  size, self.total_allocated);
            self.total_allocated = 0;
        } else {
            self.total_allocated -= size;
        }
    }

    fn check_capacities(
        &self,
        instructions: usize,
        strings: usize,
        variables: usize,
        functions: usize
    ) -> Result<()> {
        let instr_bytes = instructions * core::mem::size_of::<Opcode>();
        if instr_bytes > self.config.max_bytecode_size as usize {
            return Err(GovernError::NotAllowed("instructions"));
        }
        if strings > self.config.max_string_pool_size as usize {
            return Err(GovernError::NotAllowed("string pool"));
        }
        if variables > self.config.max_variable_count as usize {
            return Err(GovernError::NotAllowed("variables"));
        }
        if functions > self.config.max_function_count as usize {
            return Err(GovernError::NotAllowed("functions"));
        }
        Ok(())
    }

    // Admit an empty program shell with the given capacities. The
    // shell's full capacity is charged up front; on any refusal the
    // running total is untouched.
    pub fn alloc_program(
        &mut self,
        instruction_capacity: u16,
        string_capacity: u16,
        variable_capacity: u16,
        property_capacity: u16,
        function_capacity: u16
    ) -> Result<LoadedProgram> {
        self.check_capacities(
            instruction_capacity as usize,
            string_capacity as usize,
            variable_capacity as usize,
            function_capacity as usize
        )?;

        let size = shell_footprint(
            instruction_capacity as usize,
            string_capacity as usize,
            variable_capacity as usize,
            property_capacity as usize,
            function_capacity as usize
        );
        if !self.can_allocate(size) {
            return Err(GovernError::QuotaExceeded);
        }
        self.track_alloc(size);

        Ok(LoadedProgram {
            program: Program::with_capacity(
                instruction_capacity as usize,
                string_capacity as usize,
                variable_capacity as usize,
                property_capacity as usize,
                function_capacity as usize
            ),
            charged: size,
        })
    }

    // Admit a fully-built program (e.g. decoded off the wire).
    pub fn load_program(&mut self, program: Program) -> Result<LoadedProgram> {
        self.check_capacities(
            program.instructions.len(),
            program.string_pool.len(),
            program.variable_names.len(),
            program.function_names.len()
        )?;

        let size = program.footprint();
        if !self.can_allocate(size) {
            return Err(GovernError::QuotaExceeded);
        }
        self.track_alloc(size);

        Ok(LoadedProgram { program, charged: size })
    }

    // Grow a loaded program's string pool under quota.
    pub fn intern(&mut self, loaded: &mut LoadedProgram, text: &str)
        -> Result<u16>
    {
        if !self.config.dynamic_allocation {
            return Err(GovernError::DynamicAllocationDisabled);
        }
        if loaded.program.string_pool.len()
            >= self.config.max_string_pool_size as usize {
            return Err(GovernError::NotAllowed("string pool"));
        }

        let size = text.len() + 1 + core::mem::size_of::<String>();
        if !self.can_allocate(size) {
            return Err(GovernError::QuotaExceeded);
        }
        self.track_alloc(size);
        loaded.charged += size;

        loaded.program.string_pool.push(String::from(text));
        Ok((loaded.program.string_pool.len() - 1) as u16)
    }

    pub fn free_program(&mut self, loaded: LoadedProgram) {
        self.track_free(loaded.charged);
    }

    pub fn alloc_context(&mut self, program: &Program, stack_size: u16)
        -> Result<ExecContext>
    {
        if stack_size > self.config.max_stack_size {
            return Err(GovernError::NotAllowed("stack"));
        }

        let variables = program.variable_names.len();
        let size = context_footprint(stack_size as usize, variables);
        if !self.can_allocate(size) {
            return Err(GovernError::QuotaExceeded);
        }
        self.track_alloc(size);

        Ok(ExecContext::with_quota(stack_size as usize, variables, size))
    }

    pub fn free_context(&mut self, context: ExecContext) {
        self.track_free(context.charged);
    }
}


fn shell_footprint(
    instructions: usize,
    strings: usize,
    variables: usize,
    properties: usize,
    functions: usize
) -> usize {
    instructions * core::mem::size_of::<Opcode>()
        + (strings + variables + properties + functions)
            * core::mem::size_of::<String>()
}

fn context_footprint(stack: usize, variables: usize) -> usize {
    core::mem::size_of::<ExecContext>()
        + (stack + variables) * core::mem::size_of::<crate::value::Value>()
}


// Defaults derived from the platform's memory figures: a sixteenth
// of total memory for any one program (at least 8 KiB), an eighth
// for everything live at once (at least 16 KiB).
pub fn recommended(platform: PlatformMemory) -> RuntimeConfig {
    let total = platform.total_bytes;
    RuntimeConfig {
        max_bytecode_size: (total / 16).max(8 * 1024),
        max_stack_size: 128,
        max_string_pool_size: 256,
        max_variable_count: 64,
        max_function_count: 32,
        max_execution_time_ms: 1000,
        dynamic_allocation: true,
        total_memory_limit: (total / 8).max(16 * 1024),
    }
}
