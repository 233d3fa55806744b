//! The bytecode dispatcher: decode-and-execute loop, call stack
//! management, and the VM object itself.
//!
//! Three opcode families are handled by [`exec`]: boxed/general, typed
//! fast path, and fused control. This module owns everything around
//! that loop: function/native tables, the parallel call stack that
//! mirrors the register file's frame stack, GC safepoints, and the
//! tier-up/deopt hooks consulted at loop back-edges.

mod exec;

use crate::chunk::Chunk;
use crate::config::VmConfig;
use crate::error::{InterpretResult, OrusResult, RuntimeError, SourceLocation};
use crate::heap::Heap;
use crate::profiler::Profiler;
use crate::register::{RegisterFile, RegisterId, GLOBAL_BAND_SIZE};
use crate::tiering::TieringTable;
use crate::value::Value;

/// One compiled function: its baseline chunk plus calling-convention
/// metadata. Equivalent to what a compiler hands the VM for each
/// function it emits.
#[derive(Debug)]
pub struct FunctionProto {
    pub name: String,
    pub arity: u8,
    pub register_count: u16,
    pub temp_count: u16,
    pub chunk: Chunk,
}

/// A host function invoked by `CALL_NATIVE`. Takes the reconciled
/// boxed argument slice and the heap (for allocating a result), and
/// returns the value written to the destination register. This is the
/// safe-Rust shape of the `fn(argc, *Value) -> Value` ABI named in the
/// external interface: the slice carries its own length, and the heap
/// handle replaces raw allocation access.
pub type NativeFn = fn(&[Value], &mut Heap) -> OrusResult<Value>;

/// What a frame below the active one needs restored when the active
/// frame returns: which function was executing there, and where to
/// resume.
#[derive(Debug, Clone, Copy)]
struct CallInfo {
    caller_function: usize,
    return_ip: usize,
}

/// The virtual machine: everything [`exec`]'s dispatch loop reads or
/// mutates on every instruction.
pub struct Vm {
    functions: Vec<FunctionProto>,
    natives: Vec<NativeFn>,
    heap: Heap,
    registers: RegisterFile,
    call_stack: Vec<CallInfo>,
    current_function: usize,
    ip: usize,
    last_error: Option<Value>,
    is_shutting_down: bool,
    config: VmConfig,
    profiler: Profiler,
    tiering: TieringTable,
}

impl Vm {
    pub fn new(functions: Vec<FunctionProto>, natives: Vec<NativeFn>, config: VmConfig) -> Self {
        let mut heap = Heap::new(config.gc_threshold);
        let registers = RegisterFile::new(GLOBAL_BAND_SIZE, &mut heap, 1024);
        let profiler = Profiler::new(config.hot_threshold);
        Self {
            functions,
            natives,
            heap,
            registers,
            call_stack: Vec::new(),
            current_function: 0,
            ip: 0,
            last_error: None,
            is_shutting_down: false,
            config,
            profiler,
            tiering: TieringTable::new(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Read-only access for the translator: the baseline chunk a
    /// function index resolves to.
    pub(crate) fn function_chunk(&self, func: usize) -> &Chunk {
        &self.functions[func].chunk
    }

    pub(crate) fn rollout_stage(&self) -> crate::jit::rollout::RolloutStage {
        self.config.rollout_stage
    }

    /// The kind a register's typed slot currently observes, if live.
    /// The translator uses this to specialize a fused loop's counter
    /// kind at trace time.
    pub(crate) fn register_kind(&self, id: RegisterId) -> Option<crate::value::ValueKind> {
        self.registers.typed_kind(id)
    }

    pub fn last_error(&self) -> Option<&Value> {
        self.last_error.as_ref()
    }

    pub fn request_shutdown(&mut self) {
        self.is_shutting_down = true;
    }

    /// The chunk the dispatch loop should execute for the active
    /// function: its specialized chunk if one is installed and
    /// `self.current_function` hasn't fallen back to baseline, else
    /// its plain chunk.
    fn current_chunk(&self) -> &Chunk {
        self.tiering
            .specialized_chunk(self.current_function)
            .unwrap_or(&self.functions[self.current_function].chunk)
    }

    fn current_location(&self, offset: usize) -> SourceLocation {
        self.current_chunk().source_location(offset)
    }

    fn raise(&mut self, err: RuntimeError) -> InterpretResult {
        let gc = self.heap.alloc_error(err);
        self.last_error = Some(Value::Error(gc));
        InterpretResult::RuntimeError
    }

    /// Drive the dispatcher over `functions[entry]` until it returns,
    /// raises, or a shutdown request is observed between instructions.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn run(&mut self, entry: usize) -> InterpretResult {
        self.current_function = entry;
        self.ip = 0;
        self.call_stack.clear();
        let proto = &self.functions[entry];
        if let Err(err) = self.registers.frame_alloc(
            &mut self.heap,
            proto.register_count,
            proto.temp_count,
            RegisterId::new(GLOBAL_BAND_SIZE),
            RegisterId::new(GLOBAL_BAND_SIZE),
        ) {
            tracing::error!(?err, "failed to allocate the entry frame");
            return InterpretResult::CompileError;
        }
        loop {
            if self.is_shutting_down {
                while self.registers.frame_depth() > 0 {
                    self.registers.frame_free(&self.heap);
                }
                return InterpretResult::Ok;
            }
            match self.step() {
                Ok(None) => continue,
                Ok(Some(result)) => return result,
                Err(_internal) => return InterpretResult::CompileError,
            }
        }
    }

    /// Run a GC collection if the heap has crossed its threshold,
    /// rooted through every live register, spill slot, open upvalue,
    /// and the current error.
    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let error_root = self.last_error.into_iter();
        self.heap.collect(self.registers.gc_roots().chain(error_root));
    }

    fn arity_check(&self, proto: &FunctionProto, arg_count: u8) -> bool {
        proto.arity == arg_count
    }
}
