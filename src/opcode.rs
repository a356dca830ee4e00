/// Every bytecode instruction. Each is a single byte; operand shapes are
/// fixed per opcode and documented at each dispatch site in `vm`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    Constant = 0,
    ConstantLong = 1,
    Nil = 2,
    True = 3,
    False = 4,
    Pop = 5,
    Push = 6,
    Jump = 7,
    JumpIfFalse = 8,
    Loop = 9,
    GetLocal = 10,
    GetGlobal = 11,
    GetGlobalLong = 12,
    DefineGlobal = 13,
    DefineConstGlobal = 14,
    DefineGlobalLong = 15,
    DefineConstGlobalLong = 16,
    SetLocal = 17,
    SetGlobal = 18,
    SetGlobalLong = 19,
    Closure = 20,
    ClosureLong = 21,
    Call = 22,
    GetUpvalue = 23,
    SetUpvalue = 24,
    GetElementUpvalue = 25,
    SetElementUpvalue = 26,
    GetElementFromTop = 27,
    Swap = 28,
    CloseUpvalue = 29,
    Array = 30,
    ArrayLong = 31,
    Map = 32,
    MapLong = 33,
    GetElement = 34,
    SetElement = 35,
    GetElementGlobal = 36,
    SetElementGlobal = 37,
    GetElementGlobalLong = 38,
    SetElementGlobalLong = 39,
    ForEach = 40,
    SaveValue = 41,
    ReverseN = 42,
    Queue = 43,
    Deque = 44,
    QueueRewind = 45,
    QueueAdvance = 46,
    QueueClear = 47,
    IncrementNestingLvl = 48,
    DecrementNestingLvl = 49,
    CheckType = 50,
    IndirectStore = 51,
    PushFrom = 52,
    Range = 53,
    Equal = 54,
    EqualAnd = 55,
    Greater = 56,
    Less = 57,
    Add = 58,
    Subtract = 59,
    Multiply = 60,
    Divide = 61,
    Not = 62,
    Negate = 63,
    Print = 64,
    Return = 65,
    Class = 66,
    DefineProperty = 67,
    GetProperty = 68,
    SetProperty = 69,
    Method = 70,
    Invoke = 71,
    Inherit = 72,
    GetSuper = 73,
}

impl Opcode {
    /// Safe byte decode: non-opcode bytes never get reinterpreted as an
    /// opcode, unlike a raw transmute would allow.
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        let op = match byte {
            0 => Constant,
            1 => ConstantLong,
            2 => Nil,
            3 => True,
            4 => False,
            5 => Pop,
            6 => Push,
            7 => Jump,
            8 => JumpIfFalse,
            9 => Loop,
            10 => GetLocal,
            11 => GetGlobal,
            12 => GetGlobalLong,
            13 => DefineGlobal,
            14 => DefineConstGlobal,
            15 => DefineGlobalLong,
            16 => DefineConstGlobalLong,
            17 => SetLocal,
            18 => SetGlobal,
            19 => SetGlobalLong,
            20 => Closure,
            21 => ClosureLong,
            22 => Call,
            23 => GetUpvalue,
            24 => SetUpvalue,
            25 => GetElementUpvalue,
            26 => SetElementUpvalue,
            27 => GetElementFromTop,
            28 => Swap,
            29 => CloseUpvalue,
            30 => Array,
            31 => ArrayLong,
            32 => Map,
            33 => MapLong,
            34 => GetElement,
            35 => SetElement,
            36 => GetElementGlobal,
            37 => SetElementGlobal,
            38 => GetElementGlobalLong,
            39 => SetElementGlobalLong,
            40 => ForEach,
            41 => SaveValue,
            42 => ReverseN,
            43 => Queue,
            44 => Deque,
            45 => QueueRewind,
            46 => QueueAdvance,
            47 => QueueClear,
            48 => IncrementNestingLvl,
            49 => DecrementNestingLvl,
            50 => CheckType,
            51 => IndirectStore,
            52 => PushFrom,
            53 => Range,
            54 => Equal,
            55 => EqualAnd,
            56 => Greater,
            57 => Less,
            58 => Add,
            59 => Subtract,
            60 => Multiply,
            61 => Divide,
            62 => Not,
            63 => Negate,
            64 => Print,
            65 => Return,
            66 => Class,
            67 => DefineProperty,
            68 => GetProperty,
            69 => SetProperty,
            70 => Method,
            71 => Invoke,
            72 => Inherit,
            73 => GetSuper,
            _ => return None,
        };
        Some(op)
    }
}
