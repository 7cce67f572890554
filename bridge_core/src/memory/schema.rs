//! Type descriptors for the payloads the node exchanges
//!
//! A schema describes the fixed-layout primitive fields of a message and
//! whether it ends in a bounded string region. Together with a
//! [`MemoryConf`] it determines the capacity of a buffer.

use serde::Deserialize;

/// Primitive field kinds with their encoded widths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    U8,
    I8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl FieldKind {
    pub fn width(self) -> usize {
        match self {
            FieldKind::Bool | FieldKind::U8 | FieldKind::I8 => 1,
            FieldKind::I16 | FieldKind::U16 => 2,
            FieldKind::I32 | FieldKind::U32 | FieldKind::F32 => 4,
            FieldKind::I64 | FieldKind::U64 | FieldKind::F64 => 8,
        }
    }
}

/// A named primitive field at a fixed byte offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub kind: FieldKind,
}

/// Message type descriptor
#[derive(Debug, PartialEq, Eq)]
pub struct MessageSchema {
    pub type_name: &'static str,
    pub fields: &'static [Field],
    /// Bytes taken by the fixed-layout fields
    pub fixed_len: usize,
    /// Whether a bounded string region follows the fixed fields
    pub has_string: bool,
}

impl MessageSchema {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Buffer capacity under the given memory configuration
    pub fn capacity(&self, conf: &MemoryConf) -> usize {
        if self.has_string {
            self.fixed_len + conf.max_string_capacity
        } else {
            self.fixed_len
        }
    }
}

/// Service type descriptor: a request and a response schema
#[derive(Debug, PartialEq, Eq)]
pub struct ServiceSchema {
    pub type_name: &'static str,
    pub request: &'static MessageSchema,
    pub response: &'static MessageSchema,
}

/// Default memory configuration used when sizing buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MemoryConf {
    pub max_string_capacity: usize,
}

impl Default for MemoryConf {
    fn default() -> Self {
        Self {
            max_string_capacity: 20,
        }
    }
}

/// `std_msgs/String`: a single bounded text field
pub static STRING: MessageSchema = MessageSchema {
    type_name: "std_msgs/msg/String",
    fields: &[],
    fixed_len: 0,
    has_string: true,
};

const BASIC_TYPES_FIELDS: &[Field] = &[
    Field { name: "bool_value", offset: 0, kind: FieldKind::Bool },
    Field { name: "byte_value", offset: 1, kind: FieldKind::U8 },
    Field { name: "char_value", offset: 2, kind: FieldKind::U8 },
    Field { name: "int8_value", offset: 3, kind: FieldKind::I8 },
    Field { name: "uint8_value", offset: 4, kind: FieldKind::U8 },
    Field { name: "int16_value", offset: 6, kind: FieldKind::I16 },
    Field { name: "uint16_value", offset: 8, kind: FieldKind::U16 },
    Field { name: "int32_value", offset: 12, kind: FieldKind::I32 },
    Field { name: "uint32_value", offset: 16, kind: FieldKind::U32 },
    Field { name: "float32_value", offset: 20, kind: FieldKind::F32 },
    Field { name: "int64_value", offset: 24, kind: FieldKind::I64 },
    Field { name: "uint64_value", offset: 32, kind: FieldKind::U64 },
    Field { name: "float64_value", offset: 40, kind: FieldKind::F64 },
];

/// `test_msgs/BasicTypes` request; `string_value` is the trailing region
pub static BASIC_TYPES_REQUEST: MessageSchema = MessageSchema {
    type_name: "test_msgs/srv/BasicTypes_Request",
    fields: BASIC_TYPES_FIELDS,
    fixed_len: 48,
    has_string: true,
};

pub static BASIC_TYPES_RESPONSE: MessageSchema = MessageSchema {
    type_name: "test_msgs/srv/BasicTypes_Response",
    fields: BASIC_TYPES_FIELDS,
    fixed_len: 48,
    has_string: true,
};

pub static BASIC_TYPES: ServiceSchema = ServiceSchema {
    type_name: "test_msgs/srv/BasicTypes",
    request: &BASIC_TYPES_REQUEST,
    response: &BASIC_TYPES_RESPONSE,
};

/// Field the control service transforms
pub const INT16_FIELD: &str = "int16_value";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_fit_fixed_layout() {
        for schema in [&BASIC_TYPES_REQUEST, &BASIC_TYPES_RESPONSE] {
            for field in schema.fields {
                assert!(
                    field.offset + field.kind.width() <= schema.fixed_len,
                    "{} overruns {}",
                    field.name,
                    schema.type_name
                );
            }
        }
    }

    #[test]
    fn test_capacity_from_memory_conf() {
        let conf = MemoryConf::default();
        assert_eq!(STRING.capacity(&conf), 20);
        assert_eq!(BASIC_TYPES_REQUEST.capacity(&conf), 68);
        let wide = MemoryConf {
            max_string_capacity: 64,
        };
        assert_eq!(STRING.capacity(&wide), 64);
    }

    #[test]
    fn test_field_lookup() {
        let field = BASIC_TYPES_REQUEST.field(INT16_FIELD).unwrap();
        assert_eq!(field.kind, FieldKind::I16);
        assert!(STRING.field(INT16_FIELD).is_none());
    }
}
