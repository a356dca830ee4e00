use std::collections::HashMap;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::gc::{GcRef, Heap};
use crate::value::Value;

/// Const-field sentinel: a class field default of exactly this value marks
/// the field as const. Mirrors the original interpreter's own encoding
/// rather than a cleaner-but-divergent boolean flag, since user code can
/// observe this (a `const var x;` field reads back as `-1` until some
/// other mechanism assigns it).
pub const CONST_SENTINEL: Value = Value::Number(-1.0);

#[derive(Debug)]
pub struct FunctionObj {
    pub name: Option<GcRef>, // string
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
}

#[derive(Debug)]
pub struct ClosureObj {
    pub function: GcRef,
    pub upvalues: Vec<GcRef>, // UpvalueObj handles
}

#[derive(Debug, Clone)]
pub enum UpvalueState {
    /// Points at a still-live stack slot.
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct UpvalueObj {
    pub state: UpvalueState,
}

pub type NativeFn = Rc<dyn Fn(&[Value]) -> Result<Value, String>>;

pub struct NativeObj {
    pub name: String,
    pub arity: i32, // -1 means variadic
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeObj({})", self.name)
    }
}

#[derive(Debug)]
pub struct ClassObj {
    pub name: GcRef, // string
    pub methods: HashMap<String, GcRef>, // closures
    /// Insertion-ordered field defaults; `CONST_SENTINEL` marks const.
    pub field_defaults: Vec<(String, Value)>,
}

#[derive(Debug)]
pub struct InstanceObj {
    pub class: GcRef,
    pub fields: HashMap<String, Value>,
    pub field_order: Vec<String>,
}

#[derive(Debug)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: GcRef, // closure
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Nil,
    Bool,
    Number,
    String,
    Array,
    Dict,
    Range,
    Instance,
    Callable,
}

#[derive(Debug)]
pub struct ArrayObj {
    pub element_kind: Option<ElementKind>,
    pub values: Vec<Value>,
}

#[derive(Debug)]
pub struct DictObj {
    pub map: HashMap<String, Value>,
    pub order: Vec<String>,
}

#[derive(Debug)]
pub struct RangeObj {
    pub current: f64,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug)]
pub enum ObjData {
    Str(Rc<str>, u64),
    Function(FunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Native(NativeObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    Array(ArrayObj),
    Dict(DictObj),
    Range(RangeObj),
}

impl ObjData {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjData::Str(_, _) => "string",
            ObjData::Function(_) => "function",
            ObjData::Closure(_) => "function",
            ObjData::Upvalue(_) => "upvalue",
            ObjData::Native(_) => "function",
            ObjData::Class(_) => "class",
            ObjData::Instance(_) => "instance",
            ObjData::BoundMethod(_) => "function",
            ObjData::Array(_) => "array",
            ObjData::Dict(_) => "dict",
            ObjData::Range(_) => "range",
        }
    }

    /// A rough per-object byte estimate, used only for GC sizing
    /// heuristics (nextGC growth), not for layout.
    pub fn size_hint(&self) -> usize {
        match self {
            ObjData::Str(s, _) => 24 + s.len(),
            ObjData::Function(_) => 64,
            ObjData::Closure(c) => 24 + c.upvalues.len() * 8,
            ObjData::Upvalue(_) => 24,
            ObjData::Native(_) => 48,
            ObjData::Class(c) => 48 + c.field_defaults.len() * 32,
            ObjData::Instance(i) => 48 + i.fields.len() * 32,
            ObjData::BoundMethod(_) => 24,
            ObjData::Array(a) => 24 + a.values.len() * 16,
            ObjData::Dict(d) => 24 + d.map.len() * 32,
            ObjData::Range(_) => 32,
        }
    }

    /// Outgoing heap references, for the collector's tracing phase.
    pub fn outgoing_refs(&self) -> Vec<GcRef> {
        match self {
            ObjData::Str(_, _) => vec![],
            ObjData::Function(f) => f.name.into_iter().collect(),
            ObjData::Closure(c) => {
                let mut refs = vec![c.function];
                refs.extend(c.upvalues.iter().copied());
                refs
            }
            ObjData::Upvalue(u) => match &u.state {
                UpvalueState::Open(_) => vec![],
                UpvalueState::Closed(v) => value_refs(v),
            },
            ObjData::Native(_) => vec![],
            ObjData::Class(c) => {
                let mut refs = vec![c.name];
                refs.extend(c.methods.values().copied());
                for (_, v) in &c.field_defaults {
                    refs.extend(value_refs(v));
                }
                refs
            }
            ObjData::Instance(i) => {
                let mut refs = vec![i.class];
                for v in i.fields.values() {
                    refs.extend(value_refs(v));
                }
                refs
            }
            ObjData::BoundMethod(b) => {
                let mut refs = value_refs(&b.receiver);
                refs.push(b.method);
                refs
            }
            ObjData::Array(a) => a.values.iter().flat_map(value_refs).collect(),
            ObjData::Dict(d) => d.map.values().flat_map(value_refs).collect(),
            ObjData::Range(_) => vec![],
        }
    }

    pub fn display(&self, heap: &Heap) -> String {
        match self {
            ObjData::Str(s, _) => s.to_string(),
            ObjData::Function(f) => match f.name {
                Some(n) => format!("<fn {}>", heap.get(n).display(heap)),
                None => "<script>".to_string(),
            },
            ObjData::Closure(c) => heap.get(c.function).display(heap),
            ObjData::Upvalue(_) => "<upvalue>".to_string(),
            ObjData::Native(n) => format!("<native fn {}>", n.name),
            ObjData::Class(c) => heap.get(c.name).display(heap),
            ObjData::Instance(i) => format!("<instance {}>", heap.get(i.class).display(heap)),
            ObjData::BoundMethod(b) => heap.get(b.method).display(heap),
            ObjData::Array(a) => {
                let items: Vec<String> = a.values.iter().map(|v| v.to_display_string(heap)).collect();
                format!("[{}]", items.join(", "))
            }
            ObjData::Dict(d) => {
                let items: Vec<String> = d.order.iter().map(|k| {
                    let v = d.map.get(k).cloned().unwrap_or(Value::Nil);
                    format!("{}: {}", k, v.to_display_string(heap))
                }).collect();
                format!("{{{}}}", items.join(", "))
            }
            ObjData::Range(r) => format!("{}..{}", r.start, r.end),
        }
    }
}

fn value_refs(v: &Value) -> Vec<GcRef> {
    match v {
        Value::Obj(r) => vec![*r],
        _ => vec![],
    }
}
