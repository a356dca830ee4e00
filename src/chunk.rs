use crate::gc::Heap;
use crate::numeric::join_u24;
use crate::opcode::Opcode;
use crate::value::Value;

/// Bytecode plus its constant pool and a run-length-encoded line table.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    lines: Vec<(u32, u32)>, // (line, run length in bytes)
}

impl Chunk {
    pub fn new() -> Chunk {
        Chunk { code: Vec::new(), constants: Vec::new(), lines: Vec::new() }
    }

    pub fn write(&mut self, byte: u8, line: u32) {
        match self.lines.last_mut() {
            Some((last_line, count)) if *last_line == line => *count += 1,
            _ => self.lines.push((line, 1)),
        }
        self.code.push(byte);
    }

    pub fn write_op(&mut self, op: Opcode, line: u32) {
        self.write(op as u8, line);
    }

    /// Looks up the source line a given byte offset was emitted on.
    pub fn line_for_offset(&self, offset: usize) -> u32 {
        let mut covered = 0usize;
        for (line, count) in &self.lines {
            covered += *count as usize;
            if offset < covered {
                return *line;
            }
        }
        self.lines.last().map(|(l, _)| *l).unwrap_or(0)
    }

    /// Adds a value to the constant pool, returning its index. Constants
    /// are not deduplicated: two syntactically-identical literals may
    /// land at different indices, matching how a single-pass compiler
    /// emits them as it encounters each occurrence.
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        ((self.code[offset] as u16) << 8) | (self.code[offset + 1] as u16)
    }

    pub fn read_u24(&self, offset: usize) -> usize {
        join_u24([self.code[offset], self.code[offset + 1], self.code[offset + 2]])
    }

    fn function_upvalue_count(&self, constant_index: usize, heap: &Heap) -> usize {
        use crate::gc::objects::ObjData;
        match self.constants.get(constant_index) {
            Some(Value::Obj(r)) => match heap.get(*r) {
                ObjData::Function(f) => f.upvalue_count as usize,
                _ => 0,
            },
            _ => 0,
        }
    }

    pub fn disassemble(&self, name: &str, heap: &Heap) -> String {
        let mut out = format!("== {} ==\n", name);
        let mut offset = 0;
        while offset < self.code.len() {
            let (text, next) = self.disassemble_instruction(offset, heap);
            out.push_str(&text);
            out.push('\n');
            offset = next;
        }
        out
    }

    pub fn disassemble_instruction(&self, offset: usize, heap: &Heap) -> (String, usize) {
        let line = self.line_for_offset(offset);
        let prefix = format!("{:04} {:4} ", offset, line);

        let byte = self.code[offset];
        let op = match Opcode::from_byte(byte) {
            Some(op) => op,
            None => return (format!("{}UNKNOWN {}", prefix, byte), offset + 1),
        };

        macro_rules! simple {
            ($name:expr) => { (format!("{}{}", prefix, $name), offset + 1) };
        }
        macro_rules! byte_operand {
            ($name:expr) => {{
                let slot = self.code[offset + 1];
                (format!("{}{:<24} {:4}", prefix, $name, slot), offset + 2)
            }};
        }
        macro_rules! two_byte_operand {
            ($name:expr) => {{
                let a = self.code[offset + 1];
                let b = self.code[offset + 2];
                (format!("{}{:<24} {:4} {:4}", prefix, $name, a, b), offset + 3)
            }};
        }
        macro_rules! constant_operand {
            ($name:expr) => {{
                let idx = self.code[offset + 1] as usize;
                let value = self.constants.get(idx).map(|v| v.to_display_string(heap)).unwrap_or_default();
                (format!("{}{:<24} {:4} '{}'", prefix, $name, idx, value), offset + 2)
            }};
        }
        macro_rules! constant_long_operand {
            ($name:expr) => {{
                let idx = self.read_u24(offset + 1);
                let value = self.constants.get(idx).map(|v| v.to_display_string(heap)).unwrap_or_default();
                (format!("{}{:<24} {:4} '{}'", prefix, $name, idx, value), offset + 4)
            }};
        }
        macro_rules! jump_operand {
            ($name:expr, $sign:expr) => {{
                let jump = self.read_u16(offset + 1) as isize;
                let target = offset as isize + 3 + $sign * jump;
                (format!("{}{:<24} {:4} -> {}", prefix, $name, offset, target), offset + 3)
            }};
        }

        match op {
            Opcode::Constant => constant_operand!("OP_CONSTANT"),
            Opcode::ConstantLong => constant_long_operand!("OP_CONSTANT_LONG"),
            Opcode::Nil => simple!("OP_NIL"),
            Opcode::True => simple!("OP_TRUE"),
            Opcode::False => simple!("OP_FALSE"),
            Opcode::Pop => simple!("OP_POP"),
            Opcode::Push => simple!("OP_PUSH"),
            Opcode::Jump => jump_operand!("OP_JUMP", 1),
            Opcode::JumpIfFalse => jump_operand!("OP_JUMP_IF_FALSE", 1),
            Opcode::Loop => jump_operand!("OP_LOOP", -1),
            Opcode::GetLocal => byte_operand!("OP_GET_LOCAL"),
            Opcode::SetLocal => byte_operand!("OP_SET_LOCAL"),
            Opcode::Call => byte_operand!("OP_CALL"),
            Opcode::GetGlobal => constant_operand!("OP_GET_GLOBAL"),
            Opcode::GetGlobalLong => constant_long_operand!("OP_GET_GLOBAL_LONG"),
            Opcode::SetGlobal => constant_operand!("OP_SET_GLOBAL"),
            Opcode::SetGlobalLong => constant_long_operand!("OP_SET_GLOBAL_LONG"),
            Opcode::DefineGlobal => constant_operand!("OP_DEFINE_GLOBAL"),
            Opcode::DefineConstGlobal => constant_operand!("OP_DEFINE_CONST_GLOBAL"),
            Opcode::DefineGlobalLong => constant_long_operand!("OP_DEFINE_GLOBAL_LONG"),
            Opcode::DefineConstGlobalLong => constant_long_operand!("OP_DEFINE_CONST_GLOBAL_LONG"),
            Opcode::GetUpvalue => byte_operand!("OP_GET_UPVALUE"),
            Opcode::SetUpvalue => byte_operand!("OP_SET_UPVALUE"),
            Opcode::GetElementUpvalue => byte_operand!("OP_GET_ELEMENT_UPVALUE"),
            Opcode::SetElementUpvalue => byte_operand!("OP_SET_ELEMENT_UPVALUE"),
            Opcode::GetElementFromTop => simple!("OP_GET_ELEMENT_FROM_TOP"),
            Opcode::Swap => two_byte_operand!("OP_SWAP"),
            Opcode::CloseUpvalue => simple!("OP_CLOSE_UPVALUE"),
            Opcode::Array => byte_operand!("OP_ARRAY"),
            Opcode::ArrayLong => constant_long_operand!("OP_ARRAY_LONG"),
            Opcode::Map => byte_operand!("OP_MAP"),
            Opcode::MapLong => constant_long_operand!("OP_MAP_LONG"),
            Opcode::GetElement => byte_operand!("OP_GET_ELEMENT"),
            Opcode::SetElement => byte_operand!("OP_SET_ELEMENT"),
            Opcode::GetElementGlobal => constant_operand!("OP_GET_ELEMENT_GLOBAL"),
            Opcode::SetElementGlobal => constant_operand!("OP_SET_ELEMENT_GLOBAL"),
            Opcode::GetElementGlobalLong => constant_long_operand!("OP_GET_ELEMENT_GLOBAL_LONG"),
            Opcode::SetElementGlobalLong => constant_long_operand!("OP_SET_ELEMENT_GLOBAL_LONG"),
            Opcode::ForEach => byte_operand!("OP_FOR_EACH"),
            Opcode::SaveValue => simple!("OP_SAVE_VALUE"),
            Opcode::ReverseN => byte_operand!("OP_REVERSE_N"),
            Opcode::Queue => simple!("OP_QUEUE"),
            Opcode::Deque => simple!("OP_DEQUE"),
            Opcode::QueueRewind => simple!("OP_QUEUE_REWIND"),
            Opcode::QueueAdvance => simple!("OP_QUEUE_ADVANCE"),
            Opcode::QueueClear => simple!("OP_QUEUE_CLEAR"),
            Opcode::IncrementNestingLvl => simple!("OP_INCREMENT_NESTING_LVL"),
            Opcode::DecrementNestingLvl => simple!("OP_DECREMENT_NESTING_LVL"),
            Opcode::CheckType => simple!("OP_CHECK_TYPE"),
            Opcode::IndirectStore => simple!("OP_INDIRECT_STORE"),
            Opcode::PushFrom => byte_operand!("OP_PUSH_FROM"),
            Opcode::Range => simple!("OP_RANGE"),
            Opcode::Equal => simple!("OP_EQUAL"),
            Opcode::EqualAnd => simple!("OP_EQUAL_AND"),
            Opcode::Greater => simple!("OP_GREATER"),
            Opcode::Less => simple!("OP_LESS"),
            Opcode::Add => simple!("OP_ADD"),
            Opcode::Subtract => simple!("OP_SUBTRACT"),
            Opcode::Multiply => simple!("OP_MULTIPLY"),
            Opcode::Divide => simple!("OP_DIVIDE"),
            Opcode::Not => simple!("OP_NOT"),
            Opcode::Negate => simple!("OP_NEGATE"),
            Opcode::Print => simple!("OP_PRINT"),
            Opcode::Return => simple!("OP_RETURN"),
            Opcode::Class => constant_operand!("OP_CLASS"),
            Opcode::DefineProperty => two_byte_operand!("OP_DEFINE_PROPERTY"),
            Opcode::GetProperty => constant_operand!("OP_GET_PROPERTY"),
            Opcode::SetProperty => constant_operand!("OP_SET_PROPERTY"),
            Opcode::Method => constant_operand!("OP_METHOD"),
            Opcode::Invoke => two_byte_operand!("OP_INVOKE"),
            Opcode::Inherit => simple!("OP_INHERIT"),
            Opcode::GetSuper => constant_operand!("OP_GET_SUPER"),
            Opcode::Closure => {
                let idx = self.code[offset + 1] as usize;
                let upvalue_count = self.function_upvalue_count(idx, heap);
                (format!("{}{:<24} {:4}", prefix, "OP_CLOSURE", idx), offset + 2 + upvalue_count * 2)
            }
            Opcode::ClosureLong => {
                let idx = self.read_u24(offset + 1);
                let upvalue_count = self.function_upvalue_count(idx, heap);
                (format!("{}{:<24} {:4}", prefix, "OP_CLOSURE_LONG", idx), offset + 4 + upvalue_count * 2)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gc::Config;

    #[test]
    fn line_rle_tracks_runs() {
        let mut chunk = Chunk::new();
        chunk.write_op(Opcode::Nil, 1);
        chunk.write_op(Opcode::Nil, 1);
        chunk.write_op(Opcode::Pop, 2);
        assert_eq!(chunk.line_for_offset(0), 1);
        assert_eq!(chunk.line_for_offset(1), 1);
        assert_eq!(chunk.line_for_offset(2), 2);
    }

    #[test]
    fn disassembles_constants() {
        let heap = Heap::new(Config::default());
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(1.0));
        chunk.write_op(Opcode::Constant, 1);
        chunk.write(idx as u8, 1);
        let text = chunk.disassemble("test", &heap);
        assert!(text.contains("OP_CONSTANT"));
        assert!(text.contains("'1'"));
    }
}
