//! Register-less stack VM executing the bytecode the compiler emits.
//! Dispatch is a single loop over the current frame's instruction
//! pointer; calls push a new `CallFrame` instead of recursing into Rust,
//! so deep language-level recursion doesn't consume the host stack.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::gc::objects::{
    ArrayObj, BoundMethodObj, ClassObj, ClosureObj, DictObj, ElementKind, InstanceObj, NativeFn,
    NativeObj, ObjData, RangeObj, UpvalueObj, UpvalueState, CONST_SENTINEL,
};
use crate::gc::{GcRef, Heap};
use crate::opcode::Opcode;
use crate::span::Span;
use crate::trace::Trace;
use crate::value::{fnv1a_hash, Value};

const MAX_NESTING: usize = 64;
const MAX_FRAMES: usize = 1024;

struct CallFrame {
    closure: GcRef,
    ip: usize,
    slots: usize,
}

pub struct Vm<'h> {
    heap: &'h mut Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: Vec<GcRef>, // sorted descending by captured stack slot
    globals: HashMap<String, Value>,
    globals_const: HashMap<String, Value>,
    queues: Vec<Option<Value>>,
    nesting_level: usize,
    saved_value: Value,
}

type OpResult<T> = Result<T, Trace>;

impl<'h> Vm<'h> {
    pub fn new(heap: &'h mut Heap) -> Vm<'h> {
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(1024),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            globals: HashMap::new(),
            globals_const: HashMap::new(),
            queues: vec![None; MAX_NESTING],
            nesting_level: 0,
            saved_value: Value::Nil,
        };
        vm.define_native("clock", -1, Rc::new(|_args: &[Value]| {
            let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0);
            Ok(Value::Number(secs))
        }));
        vm
    }

    fn define_native(&mut self, name: &str, arity: i32, func: NativeFn) {
        let r = self.heap.allocate(ObjData::Native(NativeObj { name: name.to_string(), arity, func }));
        self.globals.insert(name.to_string(), Value::Obj(r));
    }

    /// Runs a freshly-compiled top-level function to completion.
    pub fn interpret(&mut self, function: GcRef) -> OpResult<()> {
        let closure = self.heap.allocate(ObjData::Closure(ClosureObj { function, upvalues: Vec::new() }));
        self.push(Value::Obj(closure));
        self.frames.push(CallFrame { closure, ip: 0, slots: 0 });
        self.run()
    }

    // ---- stack plumbing ----

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, depth: usize) -> Value {
        self.stack[self.stack.len() - 1 - depth]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    fn chunk_len(&self) -> usize {
        self.current_function_chunk().code.len()
    }

    fn current_closure(&self) -> &ClosureObj {
        match self.heap.get(self.frame().closure) {
            ObjData::Closure(c) => c,
            _ => unreachable!("frame closure is always a Closure"),
        }
    }

    fn current_function_chunk(&self) -> &crate::chunk::Chunk {
        let function = self.current_closure().function;
        match self.heap.get(function) {
            ObjData::Function(f) => &f.chunk,
            _ => unreachable!("closure always points at a Function"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.frame().ip;
        let byte = self.current_function_chunk().code[ip];
        self.frame_mut().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let ip = self.frame().ip;
        let v = self.current_function_chunk().read_u16(ip);
        self.frame_mut().ip += 2;
        v
    }

    fn read_u24(&mut self) -> usize {
        let ip = self.frame().ip;
        let v = self.current_function_chunk().read_u24(ip);
        self.frame_mut().ip += 3;
        v
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        self.current_function_chunk().constants[idx]
    }

    fn read_constant_long(&mut self) -> Value {
        let idx = self.read_u24();
        self.current_function_chunk().constants[idx]
    }

    fn read_string(&mut self, long: bool) -> String {
        let v = if long { self.read_constant_long() } else { self.read_constant() };
        match v {
            Value::Obj(r) => match self.heap.get(r) {
                ObjData::Str(s, _) => s.to_string(),
                _ => unreachable!("constant read as string was not a string"),
            },
            _ => unreachable!("constant read as string was not an object"),
        }
    }

    fn intern(&mut self, s: &str) -> GcRef {
        let hash = fnv1a_hash(s.as_bytes());
        self.heap.intern_string(s, hash)
    }

    // ---- errors ----

    fn error(&self, message: impl Into<String>) -> Trace {
        let frames: Vec<(Span, String)> = self
            .frames
            .iter()
            .rev()
            .map(|f| {
                let function = self.closure_function(f.closure);
                let (base_name, chunk_line) = match self.heap.get(function) {
                    ObjData::Function(func) => {
                        let name = match func.name {
                            Some(n) => self.heap.get(n).display(self.heap),
                            None => "script".to_string(),
                        };
                        (name, func.chunk.line_for_offset(f.ip.saturating_sub(1)))
                    }
                    _ => ("?".to_string(), 0),
                };
                (Span::empty(), format!("{} (line {})", base_name, chunk_line))
            })
            .collect();
        Trace::error("RuntimeError", &message.into(), frames)
    }

    fn closure_function(&self, closure: GcRef) -> GcRef {
        match self.heap.get(closure) {
            ObjData::Closure(c) => c.function,
            _ => unreachable!(),
        }
    }

    // ---- GC ----

    fn roots(&self) -> Vec<GcRef> {
        let mut roots = Vec::new();
        for v in &self.stack {
            if let Value::Obj(r) = v {
                roots.push(*r);
            }
        }
        for f in &self.frames {
            roots.push(f.closure);
        }
        roots.extend(self.open_upvalues.iter().copied());
        for v in self.globals.values().chain(self.globals_const.values()) {
            if let Value::Obj(r) = v {
                roots.push(*r);
            }
        }
        for q in &self.queues {
            if let Some(Value::Obj(r)) = q {
                roots.push(*r);
            }
        }
        if let Value::Obj(r) = self.saved_value {
            roots.push(r);
        }
        roots
    }

    fn collect_if_needed(&mut self) {
        if self.heap.nursery_full() {
            if self.heap.old_gen_over_threshold() {
                let roots = self.roots();
                self.heap.major_collect(&roots);
            }
            let roots = self.roots();
            self.heap.minor_collect(&roots);
        }
    }

    fn allocate(&mut self, data: ObjData) -> GcRef {
        self.collect_if_needed();
        self.heap.allocate(data)
    }

    // ---- main loop ----

    pub fn run(&mut self) -> OpResult<()> {
        loop {
            let byte = self.read_byte();
            let op = match Opcode::from_byte(byte) {
                Some(op) => op,
                None => return Err(self.error(format!("corrupt bytecode: unknown opcode {}", byte))),
            };

            match op {
                Opcode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                Opcode::ConstantLong => {
                    let v = self.read_constant_long();
                    self.push(v);
                }
                Opcode::Nil => self.push(Value::Nil),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::Push => {
                    let v = self.peek(0);
                    self.push(v);
                }
                Opcode::SaveValue => {
                    self.saved_value = self.pop();
                }
                Opcode::PushFrom => {
                    let _slot = self.read_byte();
                    self.push(self.saved_value);
                }
                Opcode::ReverseN => {
                    let n = self.read_byte() as usize;
                    let len = self.stack.len();
                    self.stack[len - n..].reverse();
                }
                Opcode::Swap => {
                    let a = self.read_byte() as usize;
                    let b = self.read_byte() as usize;
                    let len = self.stack.len();
                    self.stack.swap(len - 1 - a, len - 1 - b);
                }
                Opcode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                Opcode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).is_truthy() {
                        self.frame_mut().ip += offset;
                    }
                }
                Opcode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }
                Opcode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    self.push(self.stack[base + slot]);
                }
                Opcode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    self.stack[base + slot] = self.peek(0);
                }
                Opcode::GetGlobal => {
                    let name = self.read_string(false);
                    self.get_global(&name)?;
                }
                Opcode::GetGlobalLong => {
                    let name = self.read_string(true);
                    self.get_global(&name)?;
                }
                Opcode::SetGlobal => {
                    let name = self.read_string(false);
                    self.set_global(&name)?;
                }
                Opcode::SetGlobalLong => {
                    let name = self.read_string(true);
                    self.set_global(&name)?;
                }
                Opcode::DefineGlobal => {
                    let name = self.read_string(false);
                    self.define_global(name, false);
                }
                Opcode::DefineConstGlobal => {
                    let name = self.read_string(false);
                    self.define_global(name, true);
                }
                Opcode::DefineGlobalLong => {
                    let name = self.read_string(true);
                    self.define_global(name, false);
                }
                Opcode::DefineConstGlobalLong => {
                    let name = self.read_string(true);
                    self.define_global(name, true);
                }
                Opcode::GetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let uv = self.current_closure().upvalues[idx];
                    let v = self.read_upvalue(uv);
                    self.push(v);
                }
                Opcode::SetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let uv = self.current_closure().upvalues[idx];
                    let v = self.peek(0);
                    self.write_upvalue(uv, v);
                }
                Opcode::GetElementUpvalue | Opcode::SetElementUpvalue => {
                    let _ = self.read_byte();
                    return Err(self.error("fused upvalue-element opcode is not emitted by this compiler"));
                }
                Opcode::GetElementFromTop => {
                    let index = self.peek(0);
                    let container = self.peek(1);
                    let value = self.index_read(container, index)?;
                    self.push(value);
                }
                Opcode::IndirectStore => {
                    let value = self.pop();
                    let index = self.pop();
                    let container = self.pop();
                    self.index_write(container, index, value)?;
                    self.push(value);
                }
                Opcode::CheckType => {
                    return Err(self.error("this opcode is reserved for a front end this compiler doesn't use"));
                }
                Opcode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                Opcode::Array => {
                    let count = self.read_byte() as usize;
                    self.build_array(count)?;
                }
                Opcode::ArrayLong => {
                    let count = self.read_u24();
                    self.build_array(count)?;
                }
                Opcode::Map => {
                    let count = self.read_byte() as usize;
                    self.build_map(count)?;
                }
                Opcode::MapLong => {
                    let count = self.read_u24();
                    self.build_map(count)?;
                }
                Opcode::Range => {
                    let end = self.pop();
                    let start = self.pop();
                    let (s, e) = match (start, end) {
                        (Value::Number(s), Value::Number(e)) => (s, e),
                        _ => return Err(self.error("range bounds must be numbers")),
                    };
                    let r = self.allocate(ObjData::Range(RangeObj { current: s, start: s, end: e }));
                    self.push(Value::Obj(r));
                }
                Opcode::GetElement => self.get_element()?,
                Opcode::SetElement => self.set_element()?,
                Opcode::GetElementGlobal
                | Opcode::SetElementGlobal
                | Opcode::GetElementGlobalLong
                | Opcode::SetElementGlobalLong => {
                    let _ = self.read_byte();
                    return Err(self.error("fused global-element opcode is not emitted by this compiler"));
                }
                Opcode::ForEach => self.for_each()?,
                Opcode::Queue => {
                    let v = self.pop();
                    self.queues[self.nesting_level] = Some(v);
                }
                Opcode::Deque => {
                    let v = self.queues[self.nesting_level].expect("DEQUE with no queued iterable at this level");
                    self.push(v);
                }
                Opcode::QueueRewind | Opcode::QueueAdvance => {}
                Opcode::QueueClear => {
                    self.queues[self.nesting_level] = None;
                }
                Opcode::IncrementNestingLvl => {
                    if self.nesting_level + 1 >= MAX_NESTING {
                        return Err(self.error("max for-each nesting level exceeded"));
                    }
                    self.nesting_level += 1;
                }
                Opcode::DecrementNestingLvl => {
                    self.nesting_level -= 1;
                }
                Opcode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(Value::values_equal(a, b)));
                }
                Opcode::EqualAnd => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.is_truthy() && Value::values_equal(a, b)));
                }
                Opcode::Greater => self.numeric_compare(|a, b| a > b)?,
                Opcode::Less => self.numeric_compare(|a, b| a < b)?,
                Opcode::Add => self.add()?,
                Opcode::Subtract => self.numeric_binary(|a, b| a - b)?,
                Opcode::Multiply => self.numeric_binary(|a, b| a * b)?,
                Opcode::Divide => self.numeric_binary(|a, b| a / b)?,
                Opcode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(!v.is_truthy()));
                }
                Opcode::Negate => {
                    let v = self.pop();
                    match v {
                        Value::Number(n) => self.push(Value::Number(-n)),
                        _ => return Err(self.error("operand must be a number")),
                    }
                }
                Opcode::Print => {
                    let v = self.pop();
                    println!("{}", v.to_display_string(self.heap));
                }
                Opcode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                Opcode::Closure => {
                    let idx = self.read_byte() as usize;
                    self.build_closure(idx)?;
                }
                Opcode::ClosureLong => {
                    let idx = self.read_u24();
                    self.build_closure(idx)?;
                }
                Opcode::Return => {
                    let result = self.pop();
                    let base = self.frame().slots;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop(); // the top-level script's own slot-0 closure
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result);
                }
                Opcode::Class => {
                    let name_val = self.read_constant();
                    let name = match name_val {
                        Value::Obj(r) => r,
                        _ => unreachable!(),
                    };
                    let class = self.allocate(ObjData::Class(ClassObj {
                        name,
                        methods: HashMap::new(),
                        field_defaults: Vec::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                Opcode::DefineProperty => {
                    let name = self.read_string(false);
                    let is_const = self.read_byte() != 0;
                    let default = if is_const { CONST_SENTINEL } else { Value::Nil };
                    let class_ref = match self.peek(0) {
                        Value::Obj(r) => r,
                        _ => return Err(self.error("DEFINE_PROPERTY target is not a class")),
                    };
                    match self.heap.get_mut(class_ref) {
                        ObjData::Class(c) => c.field_defaults.push((name, default)),
                        _ => return Err(self.error("DEFINE_PROPERTY target is not a class")),
                    }
                }
                Opcode::GetProperty => {
                    let name = self.read_string(false);
                    self.get_property(&name)?;
                }
                Opcode::SetProperty => {
                    let name = self.read_string(false);
                    self.set_property(&name)?;
                }
                Opcode::Method => {
                    let name = self.read_string(false);
                    let closure = self.pop();
                    let closure_ref = match closure {
                        Value::Obj(r) => r,
                        _ => return Err(self.error("method body is not a closure")),
                    };
                    let class_ref = match self.peek(0) {
                        Value::Obj(r) => r,
                        _ => return Err(self.error("METHOD target is not a class")),
                    };
                    match self.heap.get_mut(class_ref) {
                        ObjData::Class(c) => {
                            c.methods.insert(name, closure_ref);
                        }
                        _ => return Err(self.error("METHOD target is not a class")),
                    }
                }
                Opcode::Invoke => {
                    let name = self.read_string(false);
                    let argc = self.read_byte() as usize;
                    self.invoke(&name, argc)?;
                }
                Opcode::Inherit => self.inherit()?,
                Opcode::GetSuper => {
                    let name = self.read_string(false);
                    self.get_super(&name)?;
                }
            }
        }
    }

    // ---- globals ----

    fn get_global(&mut self, name: &str) -> OpResult<()> {
        if let Some(v) = self.globals.get(name).or_else(|| self.globals_const.get(name)).copied() {
            self.push(v);
            Ok(())
        } else {
            Err(self.error(format!("undefined variable '{}'", name)))
        }
    }

    fn set_global(&mut self, name: &str) -> OpResult<()> {
        if self.globals_const.contains_key(name) {
            return Err(self.error(format!("'{}' is const and cannot be reassigned", name)));
        }
        if !self.globals.contains_key(name) {
            return Err(self.error(format!("undefined variable '{}'", name)));
        }
        let v = self.peek(0);
        self.globals.insert(name.to_string(), v);
        Ok(())
    }

    fn define_global(&mut self, name: String, is_const: bool) {
        let v = self.pop();
        if is_const {
            self.globals_const.insert(name, v);
        } else {
            self.globals.insert(name, v);
        }
    }

    // ---- upvalues ----

    fn read_upvalue(&self, uv: GcRef) -> Value {
        match self.heap.get(uv) {
            ObjData::Upvalue(u) => match &u.state {
                UpvalueState::Open(slot) => self.stack[*slot],
                UpvalueState::Closed(v) => *v,
            },
            _ => unreachable!(),
        }
    }

    fn write_upvalue(&mut self, uv: GcRef, v: Value) {
        let slot = match self.heap.get(uv) {
            ObjData::Upvalue(u) => match &u.state {
                UpvalueState::Open(slot) => Some(*slot),
                UpvalueState::Closed(_) => None,
            },
            _ => unreachable!(),
        };
        match slot {
            Some(slot) => self.stack[slot] = v,
            None => {
                if let ObjData::Upvalue(u) = self.heap.get_mut(uv) {
                    u.state = UpvalueState::Closed(v);
                }
            }
        }
    }

    /// Reuses an already-open upvalue pointed at `slot` if one exists,
    /// else opens a new one. The list stays sorted descending so closing
    /// everything above a threshold is a simple prefix scan.
    fn capture_upvalue(&mut self, slot: usize) -> GcRef {
        for &uv in &self.open_upvalues {
            if let ObjData::Upvalue(u) = self.heap.get(uv) {
                if let UpvalueState::Open(s) = &u.state {
                    let s = *s;
                    if s == slot {
                        return uv;
                    }
                    if s < slot {
                        break;
                    }
                }
            }
        }
        let created = self.allocate(ObjData::Upvalue(UpvalueObj { state: UpvalueState::Open(slot) }));
        let pos = self.open_upvalues.iter().position(|&uv| match self.heap.get(uv) {
            ObjData::Upvalue(u) => match &u.state {
                UpvalueState::Open(s) => *s < slot,
                _ => false,
            },
            _ => false,
        });
        match pos {
            Some(i) => self.open_upvalues.insert(i, created),
            None => self.open_upvalues.push(created),
        }
        created
    }

    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&uv) = self.open_upvalues.first() {
            let slot = match self.heap.get(uv) {
                ObjData::Upvalue(u) => match &u.state {
                    UpvalueState::Open(s) => *s,
                    UpvalueState::Closed(_) => break,
                },
                _ => break,
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            if let ObjData::Upvalue(u) = self.heap.get_mut(uv) {
                u.state = UpvalueState::Closed(value);
            }
            self.open_upvalues.remove(0);
        }
    }

    // ---- arithmetic ----

    fn numeric_binary(&mut self, f: impl Fn(f64, f64) -> f64) -> OpResult<()> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Number(f(x, y)));
                Ok(())
            }
            _ => Err(self.error("operands must be numbers")),
        }
    }

    fn numeric_compare(&mut self, f: impl Fn(f64, f64) -> bool) -> OpResult<()> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Bool(f(x, y)));
                Ok(())
            }
            _ => Err(self.error("operands must be numbers")),
        }
    }

    fn add(&mut self) -> OpResult<()> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Number(x + y));
            }
            _ => {
                let joined = format!("{}{}", a.to_display_string(self.heap), b.to_display_string(self.heap));
                let r = self.intern(&joined);
                self.collect_if_needed();
                self.push(Value::Obj(r));
            }
        }
        Ok(())
    }

    // ---- containers ----

    fn build_array(&mut self, count: usize) -> OpResult<()> {
        let start = self.stack.len() - count;
        let values: Vec<Value> = self.stack.drain(start..).collect();
        let mut kind: Option<ElementKind> = None;
        for v in &values {
            let k = element_kind_of(v, self.heap);
            match kind {
                None => kind = Some(k),
                Some(existing) if existing == k => {}
                Some(_) => return Err(self.error("array literal elements must share a type")),
            }
        }
        let arr = self.allocate(ObjData::Array(ArrayObj { element_kind: kind, values }));
        self.push(Value::Obj(arr));
        Ok(())
    }

    fn build_map(&mut self, count: usize) -> OpResult<()> {
        let start = self.stack.len() - count * 2;
        let pairs: Vec<Value> = self.stack.drain(start..).collect();
        let mut map = HashMap::new();
        let mut order = Vec::new();
        for pair in pairs.chunks(2) {
            let key = match pair[0] {
                Value::Obj(r) => match self.heap.get(r) {
                    ObjData::Str(s, _) => s.to_string(),
                    _ => return Err(self.error("dict key must be a string")),
                },
                _ => return Err(self.error("dict key must be a string")),
            };
            if !map.contains_key(&key) {
                order.push(key.clone());
            }
            map.insert(key, pair[1]);
        }
        let dict = self.allocate(ObjData::Dict(DictObj { map, order }));
        self.push(Value::Obj(dict));
        Ok(())
    }

    fn get_element(&mut self) -> OpResult<()> {
        let index = self.pop();
        let container = self.pop();
        let result = self.index_read(container, index)?;
        self.push(result);
        Ok(())
    }

    fn set_element(&mut self) -> OpResult<()> {
        let value = self.pop();
        let index = self.pop();
        let container = self.pop();
        self.index_write(container, index, value)?;
        self.push(value);
        Ok(())
    }

    fn index_read(&self, container: Value, index: Value) -> OpResult<Value> {
        match container {
            Value::Obj(r) => match self.heap.get(r) {
                ObjData::Array(a) => {
                    let i = self.as_index(index)?;
                    a.values.get(i).copied().ok_or_else(|| self.error("array index out of range"))
                }
                ObjData::Dict(d) => {
                    let key = self.as_string_key(index)?;
                    d.map.get(&key).copied().ok_or_else(|| self.error(format!("no such key '{}'", key)))
                }
                _ => Err(self.error("value is not indexable")),
            },
            _ => Err(self.error("value is not indexable")),
        }
    }

    fn index_write(&mut self, container: Value, index: Value, value: Value) -> OpResult<()> {
        let container_ref = match container {
            Value::Obj(r) => r,
            _ => return Err(self.error("value is not indexable")),
        };
        let index_usize = match self.heap.get(container_ref) {
            ObjData::Array(_) => Some(self.as_index(index)?),
            ObjData::Dict(_) => None,
            _ => return Err(self.error("value is not indexable")),
        };
        self.heap.write_barrier(container_ref, value);
        match self.heap.get_mut(container_ref) {
            ObjData::Array(a) => {
                let i = index_usize.unwrap();
                if i >= a.values.len() {
                    return Err(self.error("array index out of range"));
                }
                a.values[i] = value;
                Ok(())
            }
            ObjData::Dict(d) => {
                let key = self.as_string_key(index)?;
                if !d.map.contains_key(&key) {
                    d.order.push(key.clone());
                }
                d.map.insert(key, value);
                Ok(())
            }
            _ => unreachable!(),
        }
    }

    fn as_index(&self, v: Value) -> OpResult<usize> {
        match v {
            Value::Number(n) if n >= 0.0 => Ok(n as usize),
            _ => Err(self.error("index must be a non-negative number")),
        }
    }

    fn as_string_key(&self, v: Value) -> OpResult<String> {
        match v {
            Value::Obj(r) => match self.heap.get(r) {
                ObjData::Str(s, _) => Ok(s.to_string()),
                _ => Err(self.error("key must be a string")),
            },
            _ => Err(self.error("key must be a string")),
        }
    }

    fn for_each(&mut self) -> OpResult<()> {
        let counter_slot = self.read_byte() as usize;
        let iterable = self.pop();
        let base = self.frame().slots;
        let counter = match self.stack[base + counter_slot] {
            Value::Number(n) => n as usize,
            _ => unreachable!("for-each counter local is always a number"),
        };
        let id_slot = counter_slot - 1;

        let outcome = match iterable {
            Value::Obj(r) => match self.heap.get(r) {
                ObjData::Array(a) => {
                    if counter < a.values.len() {
                        Some(a.values[counter])
                    } else {
                        None
                    }
                }
                ObjData::Dict(d) => {
                    if counter < d.order.len() {
                        let key = d.order[counter].clone();
                        Some(Value::Obj(self.intern(&key)))
                    } else {
                        None
                    }
                }
                ObjData::Range(range) => {
                    let ascending = range.end >= range.start;
                    let value = if ascending { range.start + counter as f64 } else { range.start - counter as f64 };
                    let within = if ascending { value < range.end } else { value > range.end };
                    if within {
                        Some(Value::Number(value))
                    } else {
                        None
                    }
                }
                _ => return Err(self.error("value is not iterable")),
            },
            _ => return Err(self.error("value is not iterable")),
        };

        match outcome {
            Some(v) => {
                self.stack[base + id_slot] = v;
                self.push(Value::Bool(true));
            }
            None => self.push(Value::Bool(false)),
        }
        Ok(())
    }

    // ---- calls ----

    fn call_value(&mut self, callee: Value, argc: usize) -> OpResult<()> {
        match callee {
            Value::Obj(r) => match self.heap.get(r) {
                ObjData::Closure(_) => self.call_closure(r, argc),
                ObjData::Native(_) => self.call_native(r, argc),
                ObjData::Class(_) => self.call_class(r, argc),
                ObjData::BoundMethod(_) => self.call_bound_method(r, argc),
                _ => Err(self.error("can only call functions and classes")),
            },
            _ => Err(self.error("can only call functions and classes")),
        }
    }

    fn call_closure(&mut self, closure: GcRef, argc: usize) -> OpResult<()> {
        let function = self.closure_function(closure);
        let arity = match self.heap.get(function) {
            ObjData::Function(f) => f.arity as usize,
            _ => unreachable!(),
        };
        if argc != arity {
            return Err(self.error(format!("expected {} arguments but got {}", arity, argc)));
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.error("stack overflow"));
        }
        let slots = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure, ip: 0, slots });
        Ok(())
    }

    fn call_native(&mut self, native: GcRef, argc: usize) -> OpResult<()> {
        let (arity, func) = match self.heap.get(native) {
            ObjData::Native(n) => (n.arity, n.func.clone()),
            _ => unreachable!(),
        };
        if arity >= 0 && arity as usize != argc {
            return Err(self.error(format!("expected {} arguments but got {}", arity, argc)));
        }
        let args_start = self.stack.len() - argc;
        let result = func(&self.stack[args_start..]).map_err(|m| self.error(m))?;
        self.stack.truncate(args_start - 1);
        self.push(result);
        Ok(())
    }

    fn call_class(&mut self, class: GcRef, argc: usize) -> OpResult<()> {
        let (field_defaults, init) = match self.heap.get(class) {
            ObjData::Class(c) => (c.field_defaults.clone(), c.methods.get("init").copied()),
            _ => unreachable!(),
        };
        let mut fields = HashMap::new();
        let mut field_order = Vec::new();
        for (name, default) in field_defaults {
            field_order.push(name.clone());
            fields.insert(name, default);
        }
        let instance = self.allocate(ObjData::Instance(InstanceObj { class, fields, field_order }));
        let callee_slot = self.stack.len() - argc - 1;
        self.stack[callee_slot] = Value::Obj(instance);

        match init {
            Some(init_closure) => self.call_closure(init_closure, argc),
            None => {
                if argc != 0 {
                    return Err(self.error("this class takes no constructor arguments"));
                }
                Ok(())
            }
        }
    }

    fn call_bound_method(&mut self, bound: GcRef, argc: usize) -> OpResult<()> {
        let (receiver, method) = match self.heap.get(bound) {
            ObjData::BoundMethod(b) => (b.receiver, b.method),
            _ => unreachable!(),
        };
        let callee_slot = self.stack.len() - argc - 1;
        self.stack[callee_slot] = receiver;
        self.call_closure(method, argc)
    }

    fn build_closure(&mut self, function_idx: usize) -> OpResult<()> {
        let function = match self.current_function_chunk().constants[function_idx] {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        let upvalue_count = match self.heap.get(function) {
            ObjData::Function(f) => f.upvalue_count as usize,
            _ => unreachable!(),
        };
        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            if is_local {
                let slot = self.frame().slots + index;
                upvalues.push(self.capture_upvalue(slot));
            } else {
                upvalues.push(self.current_closure().upvalues[index]);
            }
        }
        let closure = self.allocate(ObjData::Closure(ClosureObj { function, upvalues }));
        self.push(Value::Obj(closure));
        Ok(())
    }

    // ---- properties ----

    fn get_property(&mut self, name: &str) -> OpResult<()> {
        let receiver = self.pop();
        let receiver_ref = match receiver {
            Value::Obj(r) => r,
            _ => return Err(self.error("only instances have properties")),
        };
        match self.heap.get(receiver_ref) {
            ObjData::Instance(inst) => {
                if let Some(&v) = inst.fields.get(name) {
                    self.push(v);
                    return Ok(());
                }
                let class = inst.class;
                let method = match self.heap.get(class) {
                    ObjData::Class(c) => c.methods.get(name).copied(),
                    _ => None,
                };
                match method {
                    Some(m) => {
                        let bound = self.allocate(ObjData::BoundMethod(BoundMethodObj { receiver, method: m }));
                        self.push(Value::Obj(bound));
                        Ok(())
                    }
                    None => Err(self.error(format!("undefined property '{}'", name))),
                }
            }
            ObjData::Array(_) | ObjData::Dict(_) => {
                Err(self.error(format!("'{}' must be called directly, e.g. x.{}(...)", name, name)))
            }
            _ => Err(self.error("only instances have properties")),
        }
    }

    fn set_property(&mut self, name: &str) -> OpResult<()> {
        let value = self.pop();
        let receiver = self.pop();
        let receiver_ref = match receiver {
            Value::Obj(r) => r,
            _ => return Err(self.error("only instances have properties")),
        };
        self.heap.write_barrier(receiver_ref, value);
        match self.heap.get(receiver_ref) {
            ObjData::Instance(inst) => {
                if let Some(current) = inst.fields.get(name) {
                    if Value::values_equal(*current, CONST_SENTINEL) {
                        return Err(self.error(format!("'{}' is a const field", name)));
                    }
                } else {
                    return Err(self.error(format!("undefined property '{}'", name)));
                }
            }
            _ => return Err(self.error("only instances have properties")),
        }
        if let ObjData::Instance(inst) = self.heap.get_mut(receiver_ref) {
            inst.fields.insert(name.to_string(), value);
        }
        self.push(value);
        Ok(())
    }

    fn invoke(&mut self, name: &str, argc: usize) -> OpResult<()> {
        let receiver = self.peek(argc);
        match receiver {
            Value::Obj(r) => match self.heap.get(r) {
                ObjData::Instance(inst) => {
                    if let Some(&v) = inst.fields.get(name) {
                        let callee_slot = self.stack.len() - argc - 1;
                        self.stack[callee_slot] = v;
                        return self.call_value(v, argc);
                    }
                    let class = inst.class;
                    let method = match self.heap.get(class) {
                        ObjData::Class(c) => c.methods.get(name).copied(),
                        _ => None,
                    };
                    match method {
                        Some(m) => self.call_closure(m, argc),
                        None => Err(self.error(format!("undefined method '{}'", name))),
                    }
                }
                ObjData::Array(_) => self.invoke_array_builtin(r, name, argc),
                ObjData::Dict(_) => self.invoke_dict_builtin(r, name, argc),
                _ => Err(self.error("value has no callable methods")),
            },
            _ => Err(self.error("value has no callable methods")),
        }
    }

    fn invoke_array_builtin(&mut self, arr: GcRef, name: &str, argc: usize) -> OpResult<()> {
        let args_start = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[args_start..].to_vec();
        let result = match name {
            "add" if argc == 1 => {
                let value = args[0];
                let kind = element_kind_of(&value, self.heap);
                self.heap.write_barrier(arr, value);
                match self.heap.get_mut(arr) {
                    ObjData::Array(a) => {
                        match a.element_kind {
                            Some(existing) if existing != kind => {
                                return Err(self.error("array elements must share a type"));
                            }
                            None => a.element_kind = Some(kind),
                            _ => {}
                        }
                        a.values.push(value);
                        Value::Nil
                    }
                    _ => unreachable!(),
                }
            }
            "set" if argc == 2 => {
                let i = self.as_index(args[0])?;
                let value = args[1];
                self.heap.write_barrier(arr, value);
                match self.heap.get_mut(arr) {
                    ObjData::Array(a) => {
                        if i >= a.values.len() {
                            return Err(self.error("array index out of range"));
                        }
                        a.values[i] = value;
                        value
                    }
                    _ => unreachable!(),
                }
            }
            "get" if argc == 1 => {
                let i = self.as_index(args[0])?;
                match self.heap.get(arr) {
                    ObjData::Array(a) => a.values.get(i).copied().ok_or_else(|| self.error("array index out of range"))?,
                    _ => unreachable!(),
                }
            }
            "pop" if argc == 0 => match self.heap.get_mut(arr) {
                ObjData::Array(a) => a.values.pop().ok_or_else(|| self.error("pop from empty array"))?,
                _ => unreachable!(),
            },
            _ => return Err(self.error(format!("arrays have no method '{}' with {} arguments", name, argc))),
        };
        self.stack.truncate(args_start - 1);
        self.push(result);
        Ok(())
    }

    fn invoke_dict_builtin(&mut self, dict: GcRef, name: &str, argc: usize) -> OpResult<()> {
        let args_start = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[args_start..].to_vec();
        let result = match name {
            "add" if argc == 2 => {
                let key = self.as_string_key(args[0])?;
                let value = args[1];
                self.heap.write_barrier(dict, value);
                match self.heap.get_mut(dict) {
                    ObjData::Dict(d) => {
                        if d.map.contains_key(&key) {
                            return Err(self.error(format!("key '{}' already exists", key)));
                        }
                        d.order.push(key.clone());
                        d.map.insert(key, value);
                        Value::Nil
                    }
                    _ => unreachable!(),
                }
            }
            "set" if argc == 2 => {
                let key = self.as_string_key(args[0])?;
                let value = args[1];
                self.heap.write_barrier(dict, value);
                match self.heap.get_mut(dict) {
                    ObjData::Dict(d) => {
                        if !d.map.contains_key(&key) {
                            d.order.push(key.clone());
                        }
                        d.map.insert(key, value);
                        value
                    }
                    _ => unreachable!(),
                }
            }
            "get" if argc == 1 => {
                let key = self.as_string_key(args[0])?;
                match self.heap.get(dict) {
                    ObjData::Dict(d) => d.map.get(&key).copied().ok_or_else(|| self.error(format!("no such key '{}'", key)))?,
                    _ => unreachable!(),
                }
            }
            _ => return Err(self.error(format!("dictionaries have no method '{}' with {} arguments", name, argc))),
        };
        self.stack.truncate(args_start - 1);
        self.push(result);
        Ok(())
    }

    fn inherit(&mut self) -> OpResult<()> {
        let subclass = self.pop();
        let subclass_ref = match subclass {
            Value::Obj(r) => r,
            _ => return Err(self.error("class body is not a class")),
        };
        let superclass = self.peek(0);
        let superclass_ref = match superclass {
            Value::Obj(r) => r,
            _ => return Err(self.error("superclass must be a class")),
        };
        let (methods, fields) = match self.heap.get(superclass_ref) {
            ObjData::Class(c) => (c.methods.clone(), c.field_defaults.clone()),
            _ => return Err(self.error("superclass must be a class")),
        };
        match self.heap.get_mut(subclass_ref) {
            ObjData::Class(c) => {
                for (name, method) in methods {
                    c.methods.insert(name, method);
                }
                for field in fields {
                    c.field_defaults.push(field);
                }
                Ok(())
            }
            _ => Err(self.error("class body is not a class")),
        }
    }

    fn get_super(&mut self, name: &str) -> OpResult<()> {
        let superclass = self.pop();
        let receiver = self.pop();
        let superclass_ref = match superclass {
            Value::Obj(r) => r,
            _ => return Err(self.error("'super' target is not a class")),
        };
        let method = match self.heap.get(superclass_ref) {
            ObjData::Class(c) => c.methods.get(name).copied(),
            _ => None,
        };
        match method {
            Some(m) => {
                let bound = self.allocate(ObjData::BoundMethod(BoundMethodObj { receiver, method: m }));
                self.push(Value::Obj(bound));
                Ok(())
            }
            None => Err(self.error(format!("undefined superclass method '{}'", name))),
        }
    }
}

fn element_kind_of(v: &Value, heap: &Heap) -> ElementKind {
    match v {
        Value::Nil => ElementKind::Nil,
        Value::Bool(_) => ElementKind::Bool,
        Value::Number(_) => ElementKind::Number,
        Value::Obj(r) => match heap.get(*r) {
            ObjData::Str(_, _) => ElementKind::String,
            ObjData::Array(_) => ElementKind::Array,
            ObjData::Dict(_) => ElementKind::Dict,
            ObjData::Range(_) => ElementKind::Range,
            ObjData::Instance(_) => ElementKind::Instance,
            _ => ElementKind::Callable,
        },
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;
    use crate::compiler::compile;
    use crate::gc::Config;
    use crate::source::Source;

    fn run_ok(src: &str) {
        let mut heap = Heap::new(Config::default());
        let function = compile(Source::source(src), &mut heap).expect("should compile");
        let mut vm = Vm::new(&mut heap);
        vm.interpret(function).expect("should run without error");
    }

    #[test]
    fn fibonacci() {
        run_ok("fn fib(n){ if(n<2) return n; return fib(n-1)+fib(n-2); } print fib(10);");
    }

    #[test]
    fn closure_captures_mutable_local() {
        run_ok("fn make(){ var c=0; fn inc(){ c=c+1; return c; } return inc; } var f = make(); print f(); print f(); print f();");
    }

    #[test]
    fn class_inheritance_and_super() {
        run_ok("class A { speak(){ print \"A\"; } } class B expands A { speak(){ super.speak(); print \"B\"; } } B().speak();");
    }

    #[test]
    fn array_and_dict_iteration() {
        run_ok("var a=[1,2,3]; for x in a print x; var d={\"k1\":10,\"k2\":20}; for k in d print k;");
    }

    #[test]
    fn const_global_rejection_is_a_runtime_error() {
        let mut heap = Heap::new(Config::default());
        let function = compile(Source::source("const var PI = 3; PI = 4;"), &mut heap).expect("should compile");
        let mut vm = Vm::new(&mut heap);
        assert!(vm.interpret(function).is_err());
    }

    #[test]
    fn nested_for_each_preserves_outer_iterable() {
        run_ok("var A=[1,2]; var B=[\"a\",\"b\"]; for x in A { for y in B { print x; print y; } }");
    }

    #[test]
    fn array_builtin_methods() {
        run_ok("var a=[1,2]; a.add(3); a.set(0, 9); print a.get(0); print a.pop();");
    }

    proptest! {
        /// An arithmetic expression is a chain of binary opcodes, each
        /// popping two and pushing one. If that net effect were off by
        /// even one opcode, a deep enough chain corrupts later locals'
        /// slots and either panics on a stack index or silently computes
        /// garbage; running to completion across arbitrary operands is
        /// evidence the net effect holds.
        #[test]
        fn arithmetic_chains_leave_stack_balanced(
            a in -1000.0f64..1000.0,
            b in -1000.0f64..1000.0,
            c in -1000.0f64..1000.0,
        ) {
            let src = format!(
                "var x = {:.4}; var y = {:.4}; var z = {:.4}; var r = x + y - z * x + y / (z + 1000.5); print r;",
                a, b, c,
            );
            let mut heap = Heap::new(Config::default());
            let function = compile(Source::source(&src), &mut heap).expect("should compile");
            let mut vm = Vm::new(&mut heap);
            prop_assert!(vm.interpret(function).is_ok());
        }

        /// `capture_upvalue` must keep `open_upvalues` sorted descending
        /// by slot regardless of the order captures happen in, since
        /// `close_upvalues` relies on that order to stop at the first
        /// slot below its threshold.
        #[test]
        fn open_upvalues_stay_sorted_descending(slots in prop::collection::vec(0usize..64, 1..24)) {
            let mut heap = Heap::new(Config::default());
            let mut vm = Vm::new(&mut heap);
            let mut seen = std::collections::HashSet::new();
            for slot in slots {
                if seen.insert(slot) {
                    vm.capture_upvalue(slot);
                }
            }
            let resolved: Vec<usize> = vm
                .open_upvalues
                .iter()
                .map(|&uv| match vm.heap.get(uv) {
                    ObjData::Upvalue(u) => match &u.state {
                        UpvalueState::Open(s) => *s,
                        UpvalueState::Closed(_) => unreachable!("freshly captured upvalues start open"),
                    },
                    _ => unreachable!("open_upvalues only ever holds Upvalue objects"),
                })
                .collect();
            let mut expected = resolved.clone();
            expected.sort_unstable_by(|x, y| y.cmp(x));
            prop_assert_eq!(resolved, expected);
        }
    }
}
