// (C) 2020 Brandon Lewis
//
// The unified value domain for the runtime.
//
// Every dynamically-typed quantity in the system -- config entries,
// rule-expression results, bytecode stack slots, tool parameters --
// is one of these tagged values. Strings and lists are owned by the
// value; dropping a value releases their storage in the same
// operation.
//
// Operators are strongly typed: arithmetic is defined on numbers
// only, logic on booleans only, and there is no silent coercion
// between unrelated types. The only promotion performed is
// int-to-float when the two numeric arms meet, since both are
// "numbers" to the expression language. Errors are values, not
// panics; callers that want null-propagation (the rule evaluator)
// map them, callers that want faults (the bytecode interpreter)
// forward them.

use enumflags2::BitFlags;
use serde_json::Value as Json;

use crate::util::display_float;


// Arithmetic, relational and logical operations shared by the rule
// evaluator and the bytecode instruction set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Neq,
    And,
    Or,
}


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}


// Runtime type discriminant, usable in sets for diagnostics.
#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum TypeTag {
    Null  = 0b000001,
    Bool  = 0b000010,
    Int   = 0b000100,
    Float = 0b001000,
    Str   = 0b010000,
    List  = 0b100000,
}

pub type TypeSet = BitFlags<TypeTag>;


#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Float(f32),
    Str(String),
    List(Vec<Value>),
}


#[derive(Clone, Debug, PartialEq)]
pub enum ValueError {
    TypeError {
        expect: TypeSet,
        got: TypeTag
    },
    TypeMismatch(TypeTag, TypeTag),
    DivideByZero,
}

pub type Result<T> = core::result::Result<T, ValueError>;


fn expected(expect: TypeSet, got: &Value) -> ValueError {
    ValueError::TypeError { expect, got: got.get_type() }
}

fn type_mismatch(a: &Value, b: &Value) -> ValueError {
    ValueError::TypeMismatch(a.get_type(), b.get_type())
}


// Factors out the boiler plate in operator method implementations.
//
// Each matcher takes the method name and a white-list of operand
// patterns which actually implement the operator. Anything not in
// the table is implicitly a runtime error.
macro_rules! operator {
    (un $name:ident ($expect:expr) { $( $p:pat => $e:expr ),+ } ) => {
        pub fn $name (&self) -> Result<Value> {
            use Value::*;
            match self {
                $($p => Ok($e)),+ ,
                value => Err(expected($expect, value))
            }
        }
    };

    (bin $name:ident { $( $p:pat => $e:expr ),+ } ) => {
        pub fn $name (&self, other: &Value) -> Result<Value> {
            use Value::*;
            #[allow(unreachable_patterns)]
            match (self, other) {
                $($p => Ok($e)),+ ,
                (a, b) => Err(type_mismatch(a, b))
            }
        }
    };
}


impl Value {
    operator! { bin add {
        (Int(a),   Int(b))   => Int(a.wrapping_add(*b)),
        (Int(a),   Float(b)) => Float(*a as f32 + b),
        (Float(a), Int(b))   => Float(a + *b as f32),
        (Float(a), Float(b)) => Float(a + b)
    } }

    operator! { bin sub {
        (Int(a),   Int(b))   => Int(a.wrapping_sub(*b)),
        (Int(a),   Float(b)) => Float(*a as f32 - b),
        (Float(a), Int(b))   => Float(a - *b as f32),
        (Float(a), Float(b)) => Float(a - b)
    } }

    operator! { bin mul {
        (Int(a),   Int(b))   => Int(a.wrapping_mul(*b)),
        (Int(a),   Float(b)) => Float(*a as f32 * b),
        (Float(a), Int(b))   => Float(a * *b as f32),
        (Float(a), Float(b)) => Float(a * b)
    } }

    // Division and modulo are spelled out because the zero divisor
    // is an error arm, which the operator! template cannot express.
    pub fn div(&self, other: &Value) -> Result<Value> {
        use Value::*;
        match (self, other) {
            (_, Int(0)) => Err(ValueError::DivideByZero),
            (_, Float(b)) if *b == 0.0 => Err(ValueError::DivideByZero),
            (Int(a),   Int(b))   => Ok(Int(a.wrapping_div(*b))),
            (Int(a),   Float(b)) => Ok(Float(*a as f32 / b)),
            (Float(a), Int(b))   => Ok(Float(a / *b as f32)),
            (Float(a), Float(b)) => Ok(Float(a / b)),
            (a, b) => Err(type_mismatch(a, b))
        }
    }

    pub fn modulo(&self, other: &Value) -> Result<Value> {
        use Value::*;
        match (self, other) {
            (_, Int(0)) => Err(ValueError::DivideByZero),
            (_, Float(b)) if *b == 0.0 => Err(ValueError::DivideByZero),
            (Int(a),   Int(b))   => Ok(Int(a.wrapping_rem(*b))),
            (Int(a),   Float(b)) => Ok(Float((*a as f32) % b)),
            (Float(a), Int(b))   => Ok(Float(a % *b as f32)),
            (Float(a), Float(b)) => Ok(Float(a % b)),
            (a, b) => Err(type_mismatch(a, b))
        }
    }

    operator! { bin lt {
        (Int(a),   Int(b))   => Bool(a < b),
        (Int(a),   Float(b)) => Bool((*a as f32) < *b),
        (Float(a), Int(b))   => Bool(*a < (*b as f32)),
        (Float(a), Float(b)) => Bool(a < b)
    } }

    operator! { bin gt {
        (Int(a),   Int(b))   => Bool(a > b),
        (Int(a),   Float(b)) => Bool((*a as f32) > *b),
        (Float(a), Int(b))   => Bool(*a > (*b as f32)),
        (Float(a), Float(b)) => Bool(a > b)
    } }

    operator! { bin lte {
        (Int(a),   Int(b))   => Bool(a <= b),
        (Int(a),   Float(b)) => Bool((*a as f32) <= *b),
        (Float(a), Int(b))   => Bool(*a <= (*b as f32)),
        (Float(a), Float(b)) => Bool(a <= b)
    } }

    operator! { bin gte {
        (Int(a),   Int(b))   => Bool(a >= b),
        (Int(a),   Float(b)) => Bool((*a as f32) >= *b),
        (Float(a), Int(b))   => Bool(*a >= (*b as f32)),
        (Float(a), Float(b)) => Bool(a >= b)
    } }

    operator! { bin eq {
        (Null,     Null)     => Bool(true),
        (Bool(a),  Bool(b))  => Bool(a == b),
        (Int(a),   Int(b))   => Bool(a == b),
        (Int(a),   Float(b)) => Bool((*a as f32) == *b),
        (Float(a), Int(b))   => Bool(*a == (*b as f32)),
        (Float(a), Float(b)) => Bool(a == b),
        (Str(a),   Str(b))   => Bool(a == b),
        (List(a),  List(b))  => Bool(list_eq(a, b))
    } }

    pub fn neq(&self, other: &Value) -> Result<Value> {
        match self.eq(other)? {
            Value::Bool(x) => Ok(Value::Bool(!x)),
            _ => unreachable!()
        }
    }

    // Non-short-circuit boolean operators for the bytecode
    // interpreter; the rule evaluator short-circuits at the tree
    // level before ever reaching these.
    operator! { bin and {
        (Bool(a), Bool(b)) => Bool(*a && *b)
    } }

    operator! { bin or {
        (Bool(a), Bool(b)) => Bool(*a || *b)
    } }

    operator! { un not (BitFlags::from_flag(TypeTag::Bool)) {
        Bool(a) => Bool(!a)
    } }

    operator! { un neg (TypeTag::Int | TypeTag::Float) {
        Int(a) => Int(a.wrapping_neg()),
        Float(a) => Float(-a)
    } }

    pub fn apply_binary(op: BinOp, a: &Value, b: &Value) -> Result<Value> {
        match op {
            BinOp::Add => a.add(b),
            BinOp::Sub => a.sub(b),
            BinOp::Mul => a.mul(b),
            BinOp::Div => a.div(b),
            BinOp::Mod => a.modulo(b),
            BinOp::Lt  => a.lt(b),
            BinOp::Gt  => a.gt(b),
            BinOp::Lte => a.lte(b),
            BinOp::Gte => a.gte(b),
            BinOp::Eq  => a.eq(b),
            BinOp::Neq => a.neq(b),
            BinOp::And => a.and(b),
            BinOp::Or  => a.or(b),
        }
    }

    pub fn apply_unary(op: UnOp, v: &Value) -> Result<Value> {
        match op {
            UnOp::Not => v.not(),
            UnOp::Neg => v.neg(),
        }
    }

    pub fn get_type(&self) -> TypeTag {
        match self {
            Value::Null     => TypeTag::Null,
            Value::Bool(_)  => TypeTag::Bool,
            Value::Int(_)   => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::Str(_)   => TypeTag::Str,
            Value::List(_)  => TypeTag::List,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            _ => false
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None
        }
    }

    pub fn as_number(&self) -> Option<f32> {
        match self {
            Value::Int(i) => Some(*i as f32),
            Value::Float(f) => Some(*f),
            _ => None
        }
    }

    // The string form used by template substitution and
    // notification formatting. Null renders as the empty string;
    // lists render as their JSON form.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => format!("{}", b),
            Value::Int(i) => format!("{}", i),
            Value::Float(f) => display_float(*f),
            Value::Str(s) => s.clone(),
            Value::List(_) => self.to_json().to_string(),
        }
    }

    // JSON objects have no arm in the value domain; they cross the
    // boundary as their serialized text, which is what the template
    // substituter wants anyway.
    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if i >= i64::from(i32::min_value())
                        && i <= i64::from(i32::max_value()) {
                        return Value::Int(i as i32);
                    }
                }
                Value::Float(n.as_f64().unwrap_or(0.0) as f32)
            },
            Json::String(s) => Value::Str(s.clone()),
            Json::Array(items) => Value::List(
                items.iter().map(Value::from_json).collect()
            ),
            Json::Object(_) => Value::Str(json.to_string()),
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::from(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => {
                serde_json::Number::from_f64(f64::from(*f))
                    .map(Json::Number)
                    .unwrap_or(Json::Null)
            },
            Value::Str(s) => Json::from(s.as_str()),
            Value::List(items) => Json::Array(
                items.iter().map(Value::to_json).collect()
            ),
        }
    }
}


// Structural equality helper; error arms compare unequal.
pub fn value_eq(a: &Value, b: &Value) -> bool {
    match a.eq(b) {
        Ok(Value::Bool(x)) => x,
        _ => false
    }
}

fn list_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| value_eq(x, y))
}


impl PartialEq for Value {
    fn eq(&self, rhs: &Self) -> bool {
        value_eq(self, rhs)
    }
}
