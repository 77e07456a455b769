use std::{cmp::Ordering, fmt};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SqlType {
    Int,
    Text,
    Bool,
    Bytes,
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlType::Int => "BIGINT",
            SqlType::Text => "VARCHAR",
            SqlType::Bool => "BOOL",
            SqlType::Bytes => "VARBINARY",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Int(i64),
    Text(String),
    Bool(bool),
    Bytes(Vec<u8>),
    Null,
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Declared type of a non-null value.
    pub fn sql_type(&self) -> Option<SqlType> {
        match self {
            Value::Int(_) => Some(SqlType::Int),
            Value::Text(_) => Some(SqlType::Text),
            Value::Bool(_) => Some(SqlType::Bool),
            Value::Bytes(_) => Some(SqlType::Bytes),
            Value::Null => None,
        }
    }

    /// Approximate heap + inline footprint, used for statement memory accounting.
    pub fn mem_size(&self) -> usize {
        let inline = std::mem::size_of::<Value>();
        match self {
            Value::Text(s) => inline + s.capacity(),
            Value::Bytes(b) => inline + b.capacity(),
            _ => inline,
        }
    }

    pub fn cmp_same_type(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Bytes(b) => {
                f.write_str("0x")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Null => f.write_str("NULL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering::Less;

    #[test]
    fn cmp_same_type_works() {
        assert_eq!(Value::Int(1).cmp_same_type(&Value::Int(2)), Some(Less));
        assert_eq!(Value::Int(1).cmp_same_type(&Value::Text("1".into())), None);
    }

    #[test]
    fn mem_size_counts_heap_payload() {
        let small = Value::Int(7).mem_size();
        let text = Value::Text("x".repeat(64)).mem_size();
        assert!(text >= small + 64);
    }

    #[test]
    fn display_renders_bytes_as_hex() {
        assert_eq!(Value::Bytes(vec![0xab, 0x01]).to_string(), "0xab01");
        assert_eq!(Value::Null.to_string(), "NULL");
        assert_eq!(SqlType::Text.to_string(), "VARCHAR");
    }
}
